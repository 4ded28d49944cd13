//! Balance service with pessimistic and optimistic ledger stores

pub mod audit;
pub mod cache;
pub mod config;
pub mod ledger;
pub mod retry;
pub mod seed;
pub mod service;

pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use cache::{CacheBackend, CacheLedger, InMemoryCache, RedisCache, WatchSession};
pub use config::BalanceServiceConfig;
pub use ledger::{DurableLedger, InMemoryLedgerRepository, LedgerRepository, PostgresLedgerRepository};
pub use retry::RetryPolicy;
pub use service::{BalanceService, StoreContext};
