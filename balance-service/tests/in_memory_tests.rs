use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use balance_service::cache::account_key;
use balance_service::seed::{account_id, seed_accounts};
use balance_service::{
    BalanceService, CacheBackend, InMemoryCache, InMemoryLedgerRepository, LedgerRepository,
    MemoryAuditSink, RetryPolicy, StoreContext, WatchSession,
};
use common::decimal::{dec, decode_amount, encode_amount, Amount};
use common::error::{Error, Result};
use common::model::audit::{Operation, Outcome, StoreKind};

const INITIAL_BALANCE: Amount = dec!(1000000);

async fn seeded_service() -> (Arc<BalanceService>, Arc<MemoryAuditSink>) {
    let (service, audit) = BalanceService::in_memory();
    seed_accounts(&service, 10, INITIAL_BALANCE).await.unwrap();
    (Arc::new(service), audit)
}

/// Cache wrapper that lets a competitor write the watched key right before
/// each of the first `interference` conditional writes.
#[derive(Clone)]
struct CompetingCache {
    inner: InMemoryCache,
    competitor_amount: Amount,
    interference: u32,
    interfered: Arc<AtomicU32>,
}

impl CompetingCache {
    fn new(inner: InMemoryCache, competitor_amount: Amount, interference: u32) -> Self {
        Self {
            inner,
            competitor_amount,
            interference,
            interfered: Arc::new(AtomicU32::new(0)),
        }
    }

    fn interfered(&self) -> u32 {
        self.interfered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBackend for CompetingCache {
    async fn open_session(&self) -> Result<Box<dyn WatchSession>> {
        Ok(Box::new(CompetingSession {
            cache: self.clone(),
            session: self.inner.open_session().await?,
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        self.inner.set_many(entries).await
    }
}

struct CompetingSession {
    cache: CompetingCache,
    session: Box<dyn WatchSession>,
}

#[async_trait]
impl WatchSession for CompetingSession {
    async fn watch(&mut self, key: &str) -> Result<()> {
        self.session.watch(key).await
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.session.get(key).await
    }

    async fn exec_set(&mut self, key: &str, value: &str) -> Result<bool> {
        if self.cache.interfered.fetch_add(1, Ordering::SeqCst) < self.cache.interference {
            let current = decode_amount(&self.cache.inner.peek(key).unwrap()).unwrap();
            self.cache
                .inner
                .set(key, &encode_amount(current + self.cache.competitor_amount));
        } else {
            self.cache.interfered.fetch_sub(1, Ordering::SeqCst);
        }
        self.session.exec_set(key, value).await
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.session.unwatch().await
    }
}

fn service_with_cache(
    cache: Arc<dyn CacheBackend>,
    retry: RetryPolicy,
) -> (BalanceService, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let context = StoreContext::new(
        Arc::new(InMemoryLedgerRepository::new()),
        cache,
        retry,
        audit.clone(),
    );
    (BalanceService::new(context), audit)
}

#[tokio::test]
async fn test_withdraw_over_balance_is_rejected() {
    let (service, audit) = seeded_service().await;
    let acc = account_id(0);

    let err = service.withdraw(&acc, INITIAL_BALANCE + dec!(1)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
    assert_eq!(service.get_balance(&acc).await.unwrap(), INITIAL_BALANCE);

    let err = service.fast_withdraw(&acc, dec!(1000000.01)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), INITIAL_BALANCE);

    let entries = audit.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.outcome == Outcome::Failure));
    assert_eq!(entries[0].balance_before, Some(INITIAL_BALANCE));
    assert_eq!(entries[0].balance_after, Some(INITIAL_BALANCE));
}

#[tokio::test]
async fn test_withdraw_one_past_remaining_half() {
    let (service, _) = seeded_service().await;
    let acc = account_id(6);

    service.withdraw(&acc, dec!(500000)).await.unwrap();
    let err = service.withdraw(&acc, dec!(500001)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { balance, .. } if balance == dec!(500000)));
    assert_eq!(service.get_balance(&acc).await.unwrap(), dec!(500000));

    service.fast_withdraw(&acc, dec!(500000)).await.unwrap();
    let err = service.fast_withdraw(&acc, dec!(500001)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), dec!(500000));
}

#[tokio::test]
async fn test_single_withdraw_under_balance_succeeds() {
    let (service, _) = seeded_service().await;
    let acc = account_id(1);

    let change = service.withdraw(&acc, dec!(999999)).await.unwrap();
    assert_eq!(change.after, dec!(1));

    let change = service.fast_withdraw(&acc, dec!(500001)).await;
    assert!(matches!(change, Ok(c) if c.after == dec!(499999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_durable_withdraws() {
    let (service, audit) = seeded_service().await;
    let acc = account_id(2);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            let acc = acc.clone();
            tokio::spawn(async move { service.withdraw(&acc, dec!(500000)).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(Error::InsufficientBalance { .. })))
        .count();
    assert_eq!(succeeded, 2);
    assert_eq!(insufficient, 2);
    assert_eq!(service.get_balance(&acc).await.unwrap(), dec!(0));
    assert_eq!(audit.entries().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cache_withdraws() {
    let (service, _) = seeded_service().await;
    let acc = account_id(3);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            let acc = acc.clone();
            tokio::spawn(async move { service.fast_withdraw(&acc, dec!(500000)).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::InsufficientBalance { .. }) => insufficient += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((succeeded, insufficient), (2, 2));
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), dec!(0));
}

#[tokio::test]
async fn test_missing_account() {
    let (service, audit) = seeded_service().await;

    assert!(matches!(service.get_balance("ACCOUNT-404").await, Err(Error::AccountNotFound(_))));
    assert!(matches!(service.fast_get_balance("ACCOUNT-404").await, Err(Error::AccountNotFound(_))));
    assert!(audit.entries().is_empty());

    assert!(matches!(service.deposit("ACCOUNT-404", dec!(1)).await, Err(Error::AccountNotFound(_))));
    assert!(matches!(service.fast_deposit("ACCOUNT-404", dec!(1)).await, Err(Error::AccountNotFound(_))));

    // Neither store grew a row for the unknown ID
    assert!(matches!(service.get_balance("ACCOUNT-404").await, Err(Error::AccountNotFound(_))));
    assert!(matches!(service.fast_get_balance("ACCOUNT-404").await, Err(Error::AccountNotFound(_))));

    let entries = audit.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.balance_before.is_none()));
}

#[tokio::test]
async fn test_deposit_then_withdraw_restores_balance() {
    let (service, audit) = seeded_service().await;
    let acc = account_id(4);

    service.deposit(&acc, dec!(123.45)).await.unwrap();
    service.withdraw(&acc, dec!(123.45)).await.unwrap();
    assert_eq!(service.get_balance(&acc).await.unwrap(), INITIAL_BALANCE);

    service.fast_deposit(&acc, dec!(0.05)).await.unwrap();
    service.fast_withdraw(&acc, dec!(0.05)).await.unwrap();
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), INITIAL_BALANCE);

    let entries = audit.entries();
    let kinds: Vec<_> = entries.iter().map(|e| (e.operation, e.store)).collect();
    assert_eq!(
        kinds,
        vec![
            (Operation::Deposit, StoreKind::Durable),
            (Operation::Withdraw, StoreKind::Durable),
            (Operation::Deposit, StoreKind::Cache),
            (Operation::Withdraw, StoreKind::Cache),
        ]
    );
    assert_eq!(entries[0].balance_after, Some(INITIAL_BALANCE + dec!(123.45)));
    assert!(entries.iter().all(|e| e.is_success()));
}

#[tokio::test]
async fn test_non_positive_amounts_are_rejected() {
    let (service, audit) = seeded_service().await;
    let acc = account_id(5);

    assert!(matches!(service.deposit(&acc, dec!(-5)).await, Err(Error::ValidationError(_))));
    assert!(matches!(service.withdraw(&acc, dec!(0)).await, Err(Error::ValidationError(_))));
    assert!(matches!(service.fast_withdraw(&acc, dec!(-1)).await, Err(Error::ValidationError(_))));

    assert_eq!(service.get_balance(&acc).await.unwrap(), INITIAL_BALANCE);
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), INITIAL_BALANCE);
    assert_eq!(audit.entries().len(), 3);
}

#[tokio::test]
async fn test_fast_deposit_retries_past_competitor() {
    let cache = CompetingCache::new(InMemoryCache::new(), dec!(10), 3);
    let (service, audit) = service_with_cache(Arc::new(cache.clone()), RetryPolicy::default());
    seed_accounts(&service, 1, dec!(100)).await.unwrap();
    let acc = account_id(0);

    let change = service.fast_deposit(&acc, dec!(1)).await.unwrap();

    // Three competitor deposits landed first, then ours on the fourth attempt
    assert_eq!(cache.interfered(), 3);
    assert_eq!(change.before, dec!(130));
    assert_eq!(change.after, dec!(131));
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), dec!(131));
    assert_eq!(audit.entries().len(), 1);
}

#[tokio::test]
async fn test_fast_withdraw_rechecks_balance_after_conflict() {
    // Competitor drains the account between our read and our write
    let cache = CompetingCache::new(InMemoryCache::new(), dec!(-60), 1);
    let (service, _) = service_with_cache(Arc::new(cache.clone()), RetryPolicy::immediate(100));
    seed_accounts(&service, 1, dec!(100)).await.unwrap();
    let acc = account_id(0);

    let err = service.fast_withdraw(&acc, dec!(50)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { balance, .. } if balance == dec!(40)));
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), dec!(40));
}

#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let cache = CompetingCache::new(InMemoryCache::new(), dec!(1), u32::MAX);
    let retry = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_micros(100),
        max_delay: Duration::from_millis(1),
    };
    let (service, audit) = service_with_cache(Arc::new(cache.clone()), retry);
    seed_accounts(&service, 1, dec!(100)).await.unwrap();
    let acc = account_id(0);

    let err = service.fast_deposit(&acc, dec!(1000)).await.unwrap_err();
    // The fifth attempt read 104 before the competitor's last write
    assert!(matches!(err, Error::UpdateFailed { balance: Some(b), .. } if b == dec!(104)));

    // Only the competitor's writes landed
    assert_eq!(cache.interfered(), 5);
    assert_eq!(service.fast_get_balance(&acc).await.unwrap(), dec!(105));

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, Outcome::Failure);
    assert_eq!(entries[0].balance_before, Some(dec!(104)));
    assert_eq!(entries[0].balance_after, Some(dec!(104)));
}

#[tokio::test]
async fn test_failed_durable_write_is_audited_and_rolled_back() {
    let repo = Arc::new(InMemoryLedgerRepository::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let service = BalanceService::new(StoreContext::new(
        repo.clone(),
        Arc::new(InMemoryCache::new()),
        RetryPolicy::default(),
        audit.clone(),
    ));
    seed_accounts(&service, 1, dec!(100)).await.unwrap();
    let acc = account_id(0);
    repo.fail_writes_for(&acc);

    let err = service.withdraw(&acc, dec!(30)).await.unwrap_err();
    assert!(matches!(err, Error::UpdateFailed { balance: Some(b), .. } if b == dec!(100)));
    assert_eq!(service.get_balance(&acc).await.unwrap(), dec!(100));

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, Outcome::Failure);
    assert_eq!(entries[0].balance_before, Some(dec!(100)));
    assert_eq!(entries[0].balance_after, Some(dec!(100)));

    // The aborted transaction released its row lock
    repo.clear_write_failures();
    let change = tokio::time::timeout(Duration::from_secs(1), service.withdraw(&acc, dec!(30))).await;
    assert!(matches!(change, Ok(Ok(c)) if c.after == dec!(70)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_row_lock_does_not_block_other_accounts() {
    let repo = Arc::new(InMemoryLedgerRepository::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let service = BalanceService::new(StoreContext::new(
        repo.clone(),
        Arc::new(InMemoryCache::new()),
        RetryPolicy::default(),
        audit,
    ));
    seed_accounts(&service, 2, dec!(100)).await.unwrap();

    // Hold the row lock on ACCOUNT-0
    let mut held = repo.begin_transaction().await.unwrap();
    held.lock_balance(&account_id(0)).await.unwrap();

    let other = tokio::time::timeout(Duration::from_secs(1), service.deposit(&account_id(1), dec!(1))).await;
    assert!(matches!(other, Ok(Ok(_))));

    let blocked = tokio::time::timeout(Duration::from_millis(50), service.deposit(&account_id(0), dec!(1))).await;
    assert!(blocked.is_err(), "deposit should wait for the row lock");

    held.rollback().await.unwrap();
    service.deposit(&account_id(0), dec!(1)).await.unwrap();
    assert_eq!(service.get_balance(&account_id(0)).await.unwrap(), dec!(101));
}

#[tokio::test]
async fn test_transfer_is_not_implemented() {
    let (service, audit) = seeded_service().await;

    let err = service.transfer(&account_id(0), &account_id(1), dec!(1)).await.unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
    assert_eq!(service.get_balance(&account_id(0)).await.unwrap(), INITIAL_BALANCE);
    assert_eq!(service.get_balance(&account_id(1)).await.unwrap(), INITIAL_BALANCE);
    assert!(audit.entries().is_empty());
}

#[tokio::test]
async fn test_seeding_writes_full_precision_to_cache() {
    let cache = InMemoryCache::new();
    let (service, _) = service_with_cache(Arc::new(cache.clone()), RetryPolicy::default());

    let accounts = seed_accounts(&service, 3, dec!(10.75)).await.unwrap();
    assert_eq!(accounts.len(), 3);
    assert_eq!(cache.peek(&account_key("ACCOUNT-2")).as_deref(), Some("10.75"));
    assert_eq!(service.get_balance("ACCOUNT-2").await.unwrap(), dec!(10.75));

    // Reseeding replaces the previous accounts
    seed_accounts(&service, 1, dec!(5)).await.unwrap();
    assert!(matches!(service.get_balance("ACCOUNT-2").await, Err(Error::AccountNotFound(_))));
    assert_eq!(service.get_balance("ACCOUNT-0").await.unwrap(), dec!(5));
}
