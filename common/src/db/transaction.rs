//! Transaction handling for durable balance mutations
//!
//! A transaction is the unit of pessimistic locking: `lock_balance` takes an
//! exclusive hold on one account row which is kept until the transaction is
//! committed, rolled back or dropped. Dropping an uncommitted transaction
//! rolls it back, so every exit path (early return, `?`, panic) releases the
//! lock and leaves the stored balance untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::decimal::Amount;
use crate::error::{Error, Result};

/// Transaction enum that can be either PostgreSQL or in-memory
pub enum DBTransaction {
    /// PostgreSQL transaction
    Postgres(PgTransaction),
    /// In-memory transaction
    InMemory(InMemoryTransaction),
}

/// Transaction interface methods
impl DBTransaction {
    /// Lock an account row and read its balance.
    ///
    /// Waits until no other transaction holds the same row. Returns `None`
    /// when the account does not exist.
    pub async fn lock_balance(&mut self, account_id: &str) -> Result<Option<Amount>> {
        match self {
            DBTransaction::Postgres(tx) => tx.lock_balance(account_id).await,
            DBTransaction::InMemory(tx) => tx.lock_balance(account_id).await,
        }
    }

    /// Write a new balance for a row locked by this transaction, returning rows affected
    pub async fn update_balance(&mut self, account_id: &str, balance: Amount) -> Result<u64> {
        match self {
            DBTransaction::Postgres(tx) => tx.update_balance(account_id, balance).await,
            DBTransaction::InMemory(tx) => tx.update_balance(account_id, balance).await,
        }
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        match self {
            DBTransaction::Postgres(tx) => tx.commit().await,
            DBTransaction::InMemory(tx) => tx.commit().await,
        }
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        match self {
            DBTransaction::Postgres(tx) => tx.rollback().await,
            DBTransaction::InMemory(tx) => tx.rollback().await,
        }
    }
}

/// A PostgreSQL transaction implementation
pub struct PgTransaction {
    tx: SqlxTransaction<'static, Postgres>,
}

impl PgTransaction {
    /// Create a new PgTransaction
    pub fn new(tx: SqlxTransaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    pub async fn lock_balance(&mut self, account_id: &str) -> Result<Option<Amount>> {
        sqlx::query_scalar::<_, Amount>("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::Database)
    }

    pub async fn update_balance(&mut self, account_id: &str, balance: Amount) -> Result<u64> {
        sqlx::query("UPDATE accounts SET balance = $2 WHERE id = $1")
            .bind(account_id)
            .bind(balance)
            .execute(&mut *self.tx)
            .await
            .map(|r| r.rows_affected())
            .map_err(Error::Database)
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::Database)
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Database)
    }
}

/// Transaction manager trait for creating and managing transactions
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Begin a new transaction
    async fn begin_transaction(&self) -> Result<DBTransaction>;
}

/// A PostgreSQL transaction manager implementation
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    /// Create a new PgTransactionManager
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(DBTransaction::Postgres(PgTransaction::new(tx)))
    }
}

/// One in-memory account row: committed balance plus its row lock
#[derive(Debug)]
pub struct InMemoryRow {
    /// Last committed balance
    pub balance: Amount,
    lock: Arc<Mutex<()>>,
}

impl InMemoryRow {
    pub fn new(balance: Amount) -> Self {
        Self {
            balance,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// In-memory account rows keyed by account ID
pub type InMemoryRows = Arc<DashMap<String, InMemoryRow>>;

struct LockedRow {
    _guard: OwnedMutexGuard<()>,
    balance: Amount,
    staged: Option<Amount>,
}

/// Account IDs whose writes are rejected by in-memory transactions
pub type FailingWrites = Arc<DashSet<String>>;

/// In-memory transaction holding row locks and staged writes
pub struct InMemoryTransaction {
    rows: InMemoryRows,
    failing_writes: FailingWrites,
    locked: HashMap<String, LockedRow>,
}

impl InMemoryTransaction {
    /// Create a new in-memory transaction over a set of rows
    pub fn new(rows: InMemoryRows) -> Self {
        Self::with_failing_writes(rows, Arc::new(DashSet::new()))
    }

    /// Transaction whose `update_balance` errors for every ID in `failing_writes`
    pub fn with_failing_writes(rows: InMemoryRows, failing_writes: FailingWrites) -> Self {
        Self {
            rows,
            failing_writes,
            locked: HashMap::new(),
        }
    }

    pub async fn lock_balance(&mut self, account_id: &str) -> Result<Option<Amount>> {
        if let Some(row) = self.locked.get(account_id) {
            return Ok(Some(row.staged.unwrap_or(row.balance)));
        }

        // Clone the lock handle out so the map shard is not held while waiting
        let lock = match self.rows.get(account_id) {
            Some(row) => Arc::clone(&row.lock),
            None => return Ok(None),
        };
        let guard = lock.lock_owned().await;

        // Read after acquiring so the value includes the previous holder's commit
        let balance = match self.rows.get(account_id) {
            Some(row) => row.balance,
            None => return Ok(None),
        };
        self.locked.insert(
            account_id.to_string(),
            LockedRow { _guard: guard, balance, staged: None },
        );

        Ok(Some(balance))
    }

    /// Stage a write; only rows locked by this transaction can be updated
    pub async fn update_balance(&mut self, account_id: &str, balance: Amount) -> Result<u64> {
        match self.locked.get_mut(account_id) {
            Some(_) if self.failing_writes.contains(account_id) => {
                Err(Error::Internal(format!("write rejected for {}", account_id)))
            }
            Some(row) => {
                row.staged = Some(balance);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Number of rows currently locked by this transaction
    pub fn locked_rows(&self) -> usize {
        self.locked.len()
    }

    /// Apply staged writes, then release the locks
    pub async fn commit(mut self) -> Result<()> {
        for (account_id, row) in self.locked.drain() {
            if let Some(balance) = row.staged {
                if let Some(mut stored) = self.rows.get_mut(&account_id) {
                    stored.balance = balance;
                }
            }
        }
        Ok(())
    }

    /// Discard staged writes and release the locks
    pub async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

/// In-memory transaction manager
pub struct InMemoryTransactionManager {
    rows: InMemoryRows,
    failing_writes: FailingWrites,
}

impl InMemoryTransactionManager {
    /// Create a new in-memory transaction manager over shared rows
    pub fn new(rows: InMemoryRows) -> Self {
        Self {
            rows,
            failing_writes: Arc::new(DashSet::new()),
        }
    }

    /// Make every later write to `account_id` fail until cleared
    pub fn fail_writes_for(&self, account_id: &str) {
        self.failing_writes.insert(account_id.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.failing_writes.clear();
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        Ok(DBTransaction::InMemory(InMemoryTransaction::with_failing_writes(
            Arc::clone(&self.rows),
            Arc::clone(&self.failing_writes),
        )))
    }
}
