//! Durable ledger store
//!
//! Balances live in a relational table and every mutation runs inside a
//! transaction that holds an exclusive lock on the account row. Concurrent
//! mutations of the same account are therefore applied one after another;
//! different accounts never wait on each other.

use std::sync::Arc;

use async_trait::async_trait;
use common::db::{
    DbPool, InMemoryRow, InMemoryRows, InMemoryTransactionManager, PgTransactionManager,
};
use common::decimal::Amount;
use common::error::{Error, Result};
use common::model::account::{Account, BalanceChange};
use common::{DBTransaction, TransactionManager};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

/// Repository trait defining the durable storage of account balances
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Get the transaction manager
    fn transaction_manager(&self) -> &dyn TransactionManager;

    /// Read a committed balance without taking the row lock
    async fn find_balance(&self, account_id: &str) -> Result<Option<Amount>>;

    /// Replace every stored account with `accounts`
    async fn reset_accounts(&self, accounts: &[Account]) -> Result<u64>;

    /// Begin a database transaction
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        self.transaction_manager().begin_transaction().await
    }
}

/// In-memory repository for account balances
pub struct InMemoryLedgerRepository {
    /// Account rows by ID
    pub rows: InMemoryRows,
    /// Transaction manager
    transaction_manager: InMemoryTransactionManager,
}

impl InMemoryLedgerRepository {
    /// Create a new, empty in-memory repository
    pub fn new() -> Self {
        let rows: InMemoryRows = Arc::new(DashMap::new());
        Self {
            transaction_manager: InMemoryTransactionManager::new(Arc::clone(&rows)),
            rows,
        }
    }

    /// Make every later write to `account_id` fail, leaving the row untouched
    pub fn fail_writes_for(&self, account_id: &str) {
        self.transaction_manager.fail_writes_for(account_id);
    }

    pub fn clear_write_failures(&self) {
        self.transaction_manager.clear_write_failures();
    }
}

impl Default for InMemoryLedgerRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn find_balance(&self, account_id: &str) -> Result<Option<Amount>> {
        Ok(self.rows.get(account_id).map(|row| row.balance))
    }

    async fn reset_accounts(&self, accounts: &[Account]) -> Result<u64> {
        self.rows.clear();
        for account in accounts {
            self.rows
                .insert(account.id.clone(), InMemoryRow::new(account.balance));
        }
        Ok(accounts.len() as u64)
    }
}

/// PostgreSQL repository for account balances
pub struct PostgresLedgerRepository {
    /// Database connection pool
    pool: DbPool,
    /// Transaction manager
    transaction_manager: PgTransactionManager,
}

impl PostgresLedgerRepository {
    /// Create a repository over an existing pool
    pub fn new(pool: DbPool) -> Self {
        Self {
            transaction_manager: PgTransactionManager::new(pool.clone()),
            pool,
        }
    }

    /// Connect using the service configuration and apply migrations
    pub async fn with_config(config: &crate::config::BalanceServiceConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL database with pool size: {}", config.db_pool_size);

        let pool = common::db::init_db_pool(&config.database_url, config.db_pool_size).await?;
        common::db::run_migrations(&pool).await?;

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl LedgerRepository for PostgresLedgerRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn find_balance(&self, account_id: &str) -> Result<Option<Amount>> {
        debug!("Getting balance from database for {}", account_id);

        let balance = sqlx::query_scalar::<_, Amount>("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(balance)
    }

    async fn reset_accounts(&self, accounts: &[Account]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM accounts").execute(&mut *tx).await?;

        let mut inserted = 0;
        for account in accounts {
            inserted += sqlx::query("INSERT INTO accounts (id, balance) VALUES ($1, $2)")
                .bind(&account.id)
                .bind(account.balance)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

/// Pessimistic balance store: lock the row, check, write, commit
pub struct DurableLedger {
    repo: Arc<dyn LedgerRepository>,
}

impl DurableLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn LedgerRepository> {
        &self.repo
    }

    /// Committed balance of an account, read without locking
    pub async fn get_balance(&self, account_id: &str) -> Result<Amount> {
        match self.repo.find_balance(account_id).await {
            Ok(Some(balance)) => Ok(balance),
            Ok(None) => {
                error!(account = account_id, "account not found");
                Err(Error::AccountNotFound(account_id.to_string()))
            }
            Err(e) => {
                error!(account = account_id, error = %e, "account not found");
                Err(Error::AccountNotFound(format!("{}: {}", account_id, e)))
            }
        }
    }

    /// Credit an account under its row lock
    pub async fn deposit(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        let (tx, balance) = self.lock(account_id, amount).await?;
        self.apply(tx, account_id, amount, BalanceChange::credit(balance, amount)).await
    }

    /// Debit an account under its row lock, refusing to go below zero
    pub async fn withdraw(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        let (tx, balance) = self.lock(account_id, amount).await?;

        if balance < amount {
            error!(account = account_id, balance = %balance, amount = %amount, "insufficient balance");
            // Nothing was written; the row lock is released either way
            release(tx, account_id).await;
            return Err(Error::InsufficientBalance {
                account: account_id.to_string(),
                balance,
                requested: amount,
            });
        }

        self.apply(tx, account_id, amount, BalanceChange::debit(balance, amount)).await
    }

    /// Open a transaction and take the row lock.
    ///
    /// Lock failures surface as `AccountNotFound` to callers.
    async fn lock(&self, account_id: &str, amount: Amount) -> Result<(DBTransaction, Amount)> {
        let mut tx = self.repo.begin_transaction().await.map_err(|e| {
            let e = Error::LockAcquisitionFailed(format!("{}: {}", account_id, e));
            error!(account = account_id, amount = %amount, error = %e, "failed to lock account");
            Error::AccountNotFound(account_id.to_string())
        })?;

        match tx.lock_balance(account_id).await {
            Ok(Some(balance)) => Ok((tx, balance)),
            Ok(None) => {
                error!(account = account_id, amount = %amount, "failed to lock account: no such row");
                release(tx, account_id).await;
                Err(Error::AccountNotFound(account_id.to_string()))
            }
            Err(e) => {
                let e = Error::LockAcquisitionFailed(format!("{}: {}", account_id, e));
                error!(account = account_id, amount = %amount, error = %e, "failed to lock account");
                release(tx, account_id).await;
                Err(Error::AccountNotFound(account_id.to_string()))
            }
        }
    }

    /// Write the new balance and commit, rolling back on any failure
    async fn apply(
        &self,
        mut tx: DBTransaction,
        account_id: &str,
        amount: Amount,
        change: BalanceChange,
    ) -> Result<BalanceChange> {
        let update_failed = |reason: String| Error::UpdateFailed {
            account: account_id.to_string(),
            balance: Some(change.before),
            reason,
        };

        let written = match tx.update_balance(account_id, change.after).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(account = account_id, balance = %change.after, amount = %amount, error = %e, "failed to update balance");
                release(tx, account_id).await;
                return Err(update_failed(e.to_string()));
            }
        };

        if written == 0 {
            error!(account = account_id, balance = %change.after, amount = %amount, "failed to update balance: no rows affected");
            release(tx, account_id).await;
            return Err(update_failed("no rows affected".to_string()));
        }

        // A failed commit drops the transaction, which rolls it back
        tx.commit().await.map_err(|e| {
            error!(account = account_id, balance = %change.after, amount = %amount, error = %e, "failed to commit balance");
            update_failed(e.to_string())
        })?;

        debug!(account = account_id, before = %change.before, after = %change.after, "balance committed");
        Ok(change)
    }
}

/// Roll back an aborted transaction, logging rather than masking the original error
async fn release(tx: DBTransaction, account_id: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(account = account_id, error = %e, "failed to roll back transaction");
    }
}
