//! Cache ledger store
//!
//! Balances live in a key-value cache as decimal strings. Mutations never
//! hold a lock: each attempt watches the account key, reads the balance,
//! and issues a conditional write that only commits if the key was left
//! untouched in between. An attempt that loses the race is retried under
//! the configured [`RetryPolicy`]; validation failures are returned at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::decimal::{decode_amount, encode_amount, Amount};
use common::error::{Error, Result};
use common::model::account::BalanceChange;
use common::model::audit::Operation;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::{Connection, MultiplexedConnection};
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

/// Idle watch connections kept by [`RedisCache`] for reuse
pub const DEFAULT_IDLE_WATCH_CONNECTIONS: usize = 16;

/// Cache key of an account balance
pub fn account_key(account_id: &str) -> String {
    format!("account:{}", account_id)
}

/// A connection-scoped watch transaction
#[async_trait]
pub trait WatchSession: Send {
    /// Watch a key; the next `exec_set` fails if it changes after this call
    async fn watch(&mut self, key: &str) -> Result<()>;

    /// Read a key inside the session
    async fn get(&mut self, key: &str) -> Result<Option<String>>;

    /// Conditionally write a key.
    ///
    /// Returns `false` when a watched key changed, in which case nothing was
    /// written. Clears all watches either way.
    async fn exec_set(&mut self, key: &str, value: &str) -> Result<bool>;

    /// Drop all watches without writing
    async fn unwatch(&mut self) -> Result<()>;
}

/// Key-value backend for the cache ledger
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Open a dedicated session for watch transactions
    async fn open_session(&self) -> Result<Box<dyn WatchSession>>;

    /// Plain read outside any transaction
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write many keys in one round trip
    async fn set_many(&self, entries: &[(String, String)]) -> Result<()>;
}

/// Bounded stack of idle connections
pub struct IdleConnections<C> {
    idle: Mutex<Vec<C>>,
    capacity: usize,
}

impl<C> IdleConnections<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Most recently returned connection, if any
    pub fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Return a connection; it is dropped when the pool is already full
    pub fn put(&self, conn: C) -> bool {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(conn);
        true
    }

    pub fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Redis cache backend
///
/// Plain reads and seeding share a multiplexed connection. WATCH state is
/// per connection, so every watch session needs a dedicated one. Opening a
/// connection costs a TCP handshake, so sessions that end with no watch
/// outstanding hand their connection back to a bounded idle pool. A session
/// that errors or is dropped mid-transaction closes its connection instead.
pub struct RedisCache {
    client: redis::Client,
    conn: MultiplexedConnection,
    idle: Arc<IdleConnections<Connection>>,
}

impl RedisCache {
    /// Connect to a Redis server
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_idle(redis_url, DEFAULT_IDLE_WATCH_CONNECTIONS).await
    }

    /// Connect, keeping at most `max_idle` watch connections for reuse
    pub async fn connect_with_idle(redis_url: &str, max_idle: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::ConfigurationError(format!("Invalid Redis URL: {}", e)))?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        info!("Connected to Redis");
        Ok(Self {
            client,
            conn,
            idle: Arc::new(IdleConnections::new(max_idle)),
        })
    }

    /// Number of watch connections waiting for reuse
    pub fn idle_watch_connections(&self) -> usize {
        self.idle.len()
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn open_session(&self) -> Result<Box<dyn WatchSession>> {
        let conn = match self.idle.take() {
            Some(conn) => conn,
            None => self.client.get_async_connection().await?,
        };
        Ok(Box::new(RedisWatchSession {
            conn: Some(conn),
            idle: Arc::clone(&self.idle),
            clean: true,
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

struct RedisWatchSession {
    conn: Option<Connection>,
    idle: Arc<IdleConnections<Connection>>,
    /// No WATCH outstanding and no failed command; safe to reuse
    clean: bool,
}

impl RedisWatchSession {
    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Internal("watch session already closed".to_string()))
    }
}

#[async_trait]
impl WatchSession for RedisWatchSession {
    async fn watch(&mut self, key: &str) -> Result<()> {
        self.clean = false;
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<_, ()>(self.conn()?)
            .await?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.conn()?.get(key).await?)
    }

    async fn exec_set(&mut self, key: &str, value: &str) -> Result<bool> {
        // EXEC replies nil when a watched key was modified
        let reply: Option<()> = redis::pipe()
            .atomic()
            .set(key, value)
            .ignore()
            .query_async(self.conn()?)
            .await?;
        self.clean = true;
        Ok(reply.is_some())
    }

    async fn unwatch(&mut self) -> Result<()> {
        redis::cmd("UNWATCH")
            .query_async::<_, ()>(self.conn()?)
            .await?;
        self.clean = true;
        Ok(())
    }
}

impl Drop for RedisWatchSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.clean && !self.idle.put(conn) {
                debug!("idle watch pool full, closing connection");
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    version: u64,
    value: String,
}

/// In-memory cache backend with versioned entries
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    /// Create a new, empty in-memory cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally write a key
    pub fn set(&self, key: &str, value: &str) {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.version += 1;
                entry.value = value.to_string();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry { version: 1, value: value.to_string() });
            }
        }
    }

    /// Plain synchronous read
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn version_of(&self, key: &str) -> u64 {
        self.entries.get(key).map(|entry| entry.version).unwrap_or(0)
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn open_session(&self) -> Result<Box<dyn WatchSession>> {
        Ok(Box::new(InMemoryWatchSession {
            cache: self.clone(),
            watched: HashMap::new(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.peek(key))
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value);
        }
        Ok(())
    }
}

struct InMemoryWatchSession {
    cache: InMemoryCache,
    /// Version of each watched key at watch time; 0 means absent
    watched: HashMap<String, u64>,
}

#[async_trait]
impl WatchSession for InMemoryWatchSession {
    async fn watch(&mut self, key: &str) -> Result<()> {
        self.watched.insert(key.to_string(), self.cache.version_of(key));
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.peek(key))
    }

    async fn exec_set(&mut self, key: &str, value: &str) -> Result<bool> {
        let watched = std::mem::take(&mut self.watched);

        for (other, version) in watched.iter().filter(|(other, _)| other.as_str() != key) {
            if self.cache.version_of(other) != *version {
                return Ok(false);
            }
        }

        // The entry guard makes compare and write one step for the target key
        let expected = watched.get(key).copied();
        match self.cache.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected.is_some_and(|version| version != occupied.get().version) {
                    return Ok(false);
                }
                let entry = occupied.get_mut();
                entry.version += 1;
                entry.value = value.to_string();
            }
            Entry::Vacant(vacant) => {
                if expected.is_some_and(|version| version != 0) {
                    return Ok(false);
                }
                vacant.insert(CacheEntry { version: 1, value: value.to_string() });
            }
        }

        Ok(true)
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.watched.clear();
        Ok(())
    }
}

enum Attempt {
    Committed(BalanceChange),
    /// Lost the race; carries the balance this attempt read
    Conflict(Amount),
}

/// Optimistic balance store: watch, read, conditional write, retry
pub struct CacheLedger {
    backend: Arc<dyn CacheBackend>,
    retry: RetryPolicy,
}

impl CacheLedger {
    pub fn new(backend: Arc<dyn CacheBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Cached balance of an account
    pub async fn get_balance(&self, account_id: &str) -> Result<Amount> {
        let key = account_key(account_id);
        let raw = self.backend.get(&key).await.map_err(|e| {
            error!(account = account_id, error = %e, "account not found");
            Error::AccountNotFound(format!("{}: {}", account_id, e))
        })?;

        parse_balance(account_id, raw)
    }

    /// Credit an account, retrying when the key changes underneath
    pub async fn deposit(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        self.mutate(Operation::Deposit, account_id, amount).await
    }

    /// Debit an account, retrying when the key changes underneath
    pub async fn withdraw(&self, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        self.mutate(Operation::Withdraw, account_id, amount).await
    }

    async fn mutate(&self, operation: Operation, account_id: &str, amount: Amount) -> Result<BalanceChange> {
        let key = account_key(account_id);
        let mut session = self.backend.open_session().await.map_err(|e| {
            error!(account = account_id, amount = %amount, error = %e, "failed to open watch session");
            Error::LockAcquisitionFailed(format!("{}: {}", account_id, e))
        })?;

        let attempts = self.retry.attempts();
        let mut last_seen = None;
        for attempt in 1..=attempts {
            match self.attempt(session.as_mut(), operation, &key, account_id, amount).await {
                Ok(Attempt::Committed(change)) => {
                    debug!(account = account_id, attempt, before = %change.before, after = %change.after, "balance committed");
                    return Ok(change);
                }
                Ok(Attempt::Conflict(balance)) => {
                    last_seen = Some(balance);
                    debug!(account = account_id, attempt, "watched key changed, retrying");
                    if attempt < attempts {
                        let delay = self.retry.backoff(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(e) => {
                    if let Err(unwatch_err) = session.unwatch().await {
                        warn!(account = account_id, error = %unwatch_err, "failed to clear watch");
                    }
                    return Err(e);
                }
            }
        }

        error!(account = account_id, amount = %amount, attempts, "watched key changed on every attempt");
        Err(Error::UpdateFailed {
            account: account_id.to_string(),
            balance: last_seen,
            reason: format!("concurrent modification on all {} attempts", attempts),
        })
    }

    async fn attempt(
        &self,
        session: &mut dyn WatchSession,
        operation: Operation,
        key: &str,
        account_id: &str,
        amount: Amount,
    ) -> Result<Attempt> {
        session.watch(key).await.map_err(|e| {
            error!(account = account_id, redis_key = key, error = %e, "failed to lock account");
            Error::LockAcquisitionFailed(format!("{}: {}", account_id, e))
        })?;

        let raw = session.get(key).await.map_err(|e| {
            error!(account = account_id, redis_key = key, error = %e, "failed to lock account");
            Error::LockAcquisitionFailed(format!("{}: {}", account_id, e))
        })?;
        let balance = parse_balance(account_id, raw)?;

        let change = match operation {
            Operation::Deposit => BalanceChange::credit(balance, amount),
            Operation::Withdraw => {
                if balance < amount {
                    error!(account = account_id, balance = %balance, amount = %amount, "insufficient balance");
                    return Err(Error::InsufficientBalance {
                        account: account_id.to_string(),
                        balance,
                        requested: amount,
                    });
                }
                BalanceChange::debit(balance, amount)
            }
        };

        let committed = session
            .exec_set(key, &encode_amount(change.after))
            .await
            .map_err(|e| {
                error!(
                    account = account_id,
                    balance_before = %change.before,
                    balance_after = %change.after,
                    amount = %amount,
                    error = %e,
                    "failed to update balance"
                );
                Error::UpdateFailed {
                    account: account_id.to_string(),
                    balance: Some(change.before),
                    reason: e.to_string(),
                }
            })?;

        Ok(if committed {
            Attempt::Committed(change)
        } else {
            Attempt::Conflict(change.before)
        })
    }
}

fn parse_balance(account_id: &str, raw: Option<String>) -> Result<Amount> {
    match raw {
        Some(raw) if !raw.is_empty() => decode_amount(&raw).map_err(|e| {
            error!(account = account_id, balance_string = %raw, error = %e, "internal error");
            e
        }),
        _ => {
            error!(account = account_id, "account not found");
            Err(Error::AccountNotFound(account_id.to_string()))
        }
    }
}
