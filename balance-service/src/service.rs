//! Balance service implementation
//!
//! One operation surface over both ledger stores. The plain operations go to
//! the durable store; the `fast_` variants go to the cache store. Every
//! mutation attempt is validated, dispatched, and then recorded in the audit
//! sink together with its outcome.

use std::sync::Arc;

use common::decimal::Amount;
use common::error::{Error, ErrorExt, Result};
use common::model::account::BalanceChange;
use common::model::audit::{AuditEntry, Operation, StoreKind};
use tracing::info;

use crate::audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
use crate::cache::{CacheBackend, CacheLedger, InMemoryCache, RedisCache};
use crate::ledger::{DurableLedger, InMemoryLedgerRepository, LedgerRepository, PostgresLedgerRepository};
use crate::retry::RetryPolicy;

/// Store handles owned by the service and shared by every operation
pub struct StoreContext {
    pub ledger: DurableLedger,
    pub cache: CacheLedger,
    pub audit: Arc<dyn AuditSink>,
}

impl StoreContext {
    pub fn new(
        ledger_repo: Arc<dyn LedgerRepository>,
        cache_backend: Arc<dyn CacheBackend>,
        retry: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            ledger: DurableLedger::new(ledger_repo),
            cache: CacheLedger::new(cache_backend, retry),
            audit,
        }
    }
}

/// Balance service for deposits and withdrawals under concurrent access
pub struct BalanceService {
    context: StoreContext,
}

impl BalanceService {
    /// Create a service over an explicit store context
    pub fn new(context: StoreContext) -> Self {
        Self { context }
    }

    /// Service backed by in-memory stores, auditing into memory
    pub fn in_memory() -> (Self, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let context = StoreContext::new(
            Arc::new(InMemoryLedgerRepository::new()),
            Arc::new(InMemoryCache::new()),
            RetryPolicy::default(),
            audit.clone(),
        );
        (Self::new(context), audit)
    }

    /// Connect to PostgreSQL and Redis using a configuration
    pub async fn with_config(config: &crate::config::BalanceServiceConfig) -> Result<Self> {
        let ledger_repo = PostgresLedgerRepository::with_config(config)
            .await
            .with_context(|| "Failed to connect ledger store")?;
        let cache_backend = RedisCache::connect(&config.redis_url)
            .await
            .with_context(|| "Failed to connect cache store")?;

        Ok(Self::new(StoreContext::new(
            Arc::new(ledger_repo),
            Arc::new(cache_backend),
            config.cache_retry,
            Arc::new(TracingAuditSink),
        )))
    }

    pub fn context(&self) -> &StoreContext {
        &self.context
    }

    /// Balance from the durable store
    pub async fn get_balance(&self, account_id: &str) -> Result<Amount> {
        self.context.ledger.get_balance(account_id).await
    }

    /// Deposit through the durable store
    pub async fn deposit(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        info!("Depositing {} to account {}", amount, account_id);
        let result = match validate_amount(amount) {
            Ok(()) => self.context.ledger.deposit(account_id, amount).await,
            Err(e) => Err(e),
        };
        self.audit(Operation::Deposit, StoreKind::Durable, account_id, amount, result)
    }

    /// Withdraw through the durable store
    pub async fn withdraw(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        info!("Withdrawing {} from account {}", amount, account_id);
        let result = match validate_amount(amount) {
            Ok(()) => self.context.ledger.withdraw(account_id, amount).await,
            Err(e) => Err(e),
        };
        self.audit(Operation::Withdraw, StoreKind::Durable, account_id, amount, result)
    }

    /// Balance from the cache store
    pub async fn fast_get_balance(&self, account_id: &str) -> Result<Amount> {
        self.context.cache.get_balance(account_id).await
    }

    /// Deposit through the cache store
    pub async fn fast_deposit(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        info!("Fast depositing {} to account {}", amount, account_id);
        let result = match validate_amount(amount) {
            Ok(()) => self.context.cache.deposit(account_id, amount).await,
            Err(e) => Err(e),
        };
        self.audit(Operation::Deposit, StoreKind::Cache, account_id, amount, result)
    }

    /// Withdraw through the cache store
    pub async fn fast_withdraw(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        info!("Fast withdrawing {} from account {}", amount, account_id);
        let result = match validate_amount(amount) {
            Ok(()) => self.context.cache.withdraw(account_id, amount).await,
            Err(e) => Err(e),
        };
        self.audit(Operation::Withdraw, StoreKind::Cache, account_id, amount, result)
    }

    /// Move funds between two accounts.
    ///
    /// Cross-account atomicity has no defined semantics yet, so this always
    /// fails without touching either account.
    pub async fn transfer(&self, from: &str, to: &str, amount: Amount) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "transfer of {} from {} to {}",
            amount, from, to
        )))
    }

    fn audit(
        &self,
        operation: Operation,
        store: StoreKind,
        account_id: &str,
        amount: Amount,
        result: Result<BalanceChange>,
    ) -> Result<BalanceChange> {
        let entry = AuditEntry::record(operation, store, account_id, amount, result.as_ref());
        self.context.audit.record(entry);
        result
    }
}

fn validate_amount(amount: Amount) -> Result<()> {
    if amount <= Amount::ZERO {
        return Err(Error::ValidationError(format!("amount must be positive, got {}", amount)));
    }
    Ok(())
}
