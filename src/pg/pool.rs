//! PostgreSQL connection pool.
//!
//! This module provides a connection pool built on top of our custom
//! PostgreSQL connection implementation.
//!
//! Capacity is a semaphore with one permit per connection. Tokio's semaphore
//! queues waiters in FIFO order and drops a waiter cleanly when its acquire
//! future is dropped, so a cancelled or timed-out acquire never leaks a slot.
//! A checked-out connection keeps its permit until it is back in the idle
//! list, discarded, or reset by a background task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::cancel::CancelKey;
use super::connection::{parse_duration, parse_url, PgConfig, PgConnection, QueryResult, RowStream};
use super::retry::RetryPolicy;
use super::statement::PreparedStatement;
use super::types::PgValue;
use crate::error::{Error, Result};

/// Upper bound on rolling back / draining a connection handed back dirty.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    /// Settings for each physical connection
    pub connection: PgConfig,
    /// Connections opened eagerly and kept by the idle reaper
    pub min_connections: u32,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Idle connections older than this are closed (above `min_connections`)
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are recycled
    pub max_lifetime: Option<Duration>,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
    /// Default deadline for statements run through [`crate::Db`]
    pub statement_timeout: Option<Duration>,
    /// Reconnect policy for connection-level failures
    pub retry: RetryPolicy,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            connection: PgConfig::default(),
            min_connections: 0,
            max_connections: 10,
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            acquire_timeout: Duration::from_secs(30),
            statement_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl PgPoolConfig {
    /// Create a pool configuration around a connection configuration.
    pub fn new(connection: PgConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    /// Parse a connection URL including pool parameters.
    pub fn from_url(url: &str) -> Result<Self> {
        let (connection, params) = parse_url(url)?;
        let mut config = Self::new(connection);
        for (key, value) in params {
            let count = |v: &str| {
                v.parse::<u32>()
                    .map_err(|_| Error::Config(format!("Invalid {}: {}", key, v)))
            };
            match key.as_str() {
                "min_connections" => config.min_connections = count(&value)?,
                "max_connections" => config.max_connections = count(&value)?,
                "idle_timeout" => config.idle_timeout = Some(parse_duration(&value)?),
                "max_lifetime" => config.max_lifetime = Some(parse_duration(&value)?),
                "acquire_timeout" => config.acquire_timeout = parse_duration(&value)?,
                "statement_timeout" => config.statement_timeout = Some(parse_duration(&value)?),
                _ => return Err(Error::Config(format!("Unknown URL parameter: {}", key))),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the statement cache capacity per connection.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.connection.statement_cache_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquires served from the idle list
    pub hits: u64,
    /// Acquires that opened a new connection
    pub misses: u64,
    /// Acquires that gave up waiting
    pub timeouts: u64,
    /// Open connections (idle + checked out + resetting)
    pub total: usize,
    pub idle: usize,
    /// Connections discarded because they were broken or expired
    pub stale: u64,
    /// Callers currently waiting for a slot
    pub waiting: usize,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool. A connection left
/// mid-transaction or with unread results is rolled back and drained in the
/// background before anyone else can check it out; a broken one is closed.
pub struct PooledConnection {
    /// The actual connection (None once handed back)
    conn: Option<PgConnection>,
    /// Reference back to the pool
    pool: Arc<PgPoolInner>,
    /// Semaphore permit (controls pool size)
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// The underlying connection.
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Execute a simple query.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryResult>> {
        self.connection()?.simple_query(query).await
    }

    /// Execute a parameterized query.
    pub async fn query(&mut self, query: &str, params: &[PgValue]) -> Result<QueryResult> {
        self.connection()?.query(query, params).await
    }

    /// Start a query and stream its rows.
    pub async fn query_stream(&mut self, query: &str, params: &[PgValue]) -> Result<RowStream<'_>> {
        self.connection()?.query_stream(query, params).await
    }

    /// Execute a statement and return the rows it affected (-1 if none).
    pub async fn execute(&mut self, query: &str, params: &[PgValue]) -> Result<i64> {
        self.connection()?.execute(query, params).await
    }

    pub async fn prepare(&mut self, query: &str) -> Result<Arc<PreparedStatement>> {
        self.connection()?.prepare(query).await
    }

    /// Begin a transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.connection()?.begin().await
    }

    /// Commit the transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await
    }

    /// Rollback the transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await
    }

    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.conn.as_ref().map(PgConnection::cancel_key)
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Take the connection out of the pool for good. Its slot is freed and
    /// the pool may open a replacement.
    pub fn detach(mut self) -> Option<PgConnection> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.pool.total.fetch_sub(1, Ordering::Relaxed);
        }
        conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.permit.take());
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: PgConnection,
    since: Instant,
}

/// Internal pool state.
struct PgPoolInner {
    /// Pool configuration
    config: PgPoolConfig,
    /// Idle connections, most recently returned at the back
    idle: Mutex<VecDeque<IdleConnection>>,
    /// Semaphore to limit total connections
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    /// Stops the idle reaper
    shutdown: CancellationToken,
    total: AtomicUsize,
    waiting: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
}

impl PgPoolInner {
    fn is_expired(&self, conn: &PgConnection) -> bool {
        self.config
            .max_lifetime
            .is_some_and(|lifetime| conn.age() >= lifetime)
    }

    fn push_idle(&self, conn: PgConnection) {
        if self.closed.load(Ordering::Acquire) {
            self.discard(conn, "pool closed");
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    fn discard(&self, conn: PgConnection, reason: &'static str) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        self.stale.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pid = conn.backend_pid(), reason, "Discarding connection");
        // Dropping the socket ends the session on the server.
        drop(conn);
    }

    /// Return a connection handed back by a `PooledConnection`. The permit is
    /// released only after the connection is idle again or gone.
    fn release(self: &Arc<Self>, mut conn: PgConnection, permit: Option<OwnedSemaphorePermit>) {
        if conn.is_closed() {
            self.discard(conn, "broken");
            return;
        }
        if self.is_expired(&conn) {
            self.discard(conn, "max lifetime reached");
            return;
        }
        if conn.is_clean() {
            self.push_idle(conn);
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.discard(conn, "dirty outside runtime");
            return;
        };
        let pool = Arc::clone(self);
        handle.spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(RESET_TIMEOUT, conn.reset()).await {
                Ok(Ok(())) => pool.push_idle(conn),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to reset connection");
                    pool.discard(conn, "reset failed");
                }
                Err(_) => {
                    tracing::warn!(pid = conn.backend_pid(), "Connection reset timed out");
                    pool.discard(conn, "reset timed out");
                }
            }
        });
    }

    /// Close idle connections past their idle timeout or lifetime, keeping
    /// `min_connections` open.
    fn reap(&self) -> Vec<PgConnection> {
        let min = self.config.min_connections as usize;
        let mut reaped = Vec::new();
        let mut idle = self.idle.lock();
        let mut kept = VecDeque::with_capacity(idle.len());
        // Oldest first
        while let Some(entry) = idle.pop_front() {
            let open = self.total.load(Ordering::Relaxed);
            let idle_expired = self
                .config
                .idle_timeout
                .is_some_and(|t| entry.since.elapsed() >= t)
                && open > min;
            if entry.conn.is_closed() || self.is_expired(&entry.conn) || idle_expired {
                self.total.fetch_sub(1, Ordering::Relaxed);
                reaped.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        *idle = kept;
        reaped
    }
}

async fn run_reaper(pool: Weak<PgPoolInner>, period: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        let Some(inner) = pool.upgrade() else { return };
        let reaped = inner.reap();
        drop(inner);
        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Closed idle connections");
        }
        for mut conn in reaped {
            let _ = conn.close().await;
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// The pool maintains a set of reusable connections, each with its own
/// prepared statement cache. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a new connection pool, opening `min_connections` eagerly.
    pub async fn connect(config: PgPoolConfig) -> Result<Self> {
        config.validate()?;
        let reap_period = config
            .idle_timeout
            .into_iter()
            .chain(config.max_lifetime)
            .min()
            .map(|d| (d / 2).clamp(Duration::from_millis(100), Duration::from_secs(30)));

        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            total: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        });

        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.open().await?;
            pool.inner.push_idle(conn);
        }

        if let Some(period) = reap_period {
            tokio::spawn(run_reaper(
                Arc::downgrade(&pool.inner),
                period,
                pool.inner.shutdown.clone(),
            ));
        }

        tracing::debug!(
            addr = %pool.inner.config.connection.addr(),
            max = pool.inner.config.max_connections,
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Create a pool from a URL (see [`PgPoolConfig::from_url`]).
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(PgPoolConfig::from_url(url)?).await
    }

    /// Get a connection, waiting at most the configured `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Get a connection, waiting at most `timeout` for a free slot.
    ///
    /// Dropping the returned future while it waits gives up the place in
    /// the queue without side effects.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit = {
            let _waiting = WaitingGuard::new(&inner.waiting);
            tokio::time::timeout(timeout, Arc::clone(&inner.semaphore).acquire_owned()).await
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout = ?timeout, "Timed out waiting for a pooled connection");
                return Err(Error::Timeout);
            }
        };

        let conn = match self.take_idle() {
            Some(conn) => {
                inner.hits.fetch_add(1, Ordering::Relaxed);
                conn
            }
            None => {
                inner.misses.fetch_add(1, Ordering::Relaxed);
                self.open().await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            permit: Some(permit),
        })
    }

    /// Get a connection unless `token` fires first.
    pub async fn acquire_with_cancel(&self, token: &CancellationToken) -> Result<PooledConnection> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            res = self.acquire() => res,
        }
    }

    fn take_idle(&self) -> Option<PgConnection> {
        loop {
            let entry = self.inner.idle.lock().pop_back()?;
            if entry.conn.is_closed() {
                self.inner.discard(entry.conn, "broken while idle");
            } else if self.inner.is_expired(&entry.conn) {
                self.inner.discard(entry.conn, "max lifetime reached");
            } else {
                return Some(entry.conn);
            }
        }
    }

    /// Open a connection counted against the pool.
    async fn open(&self) -> Result<PgConnection> {
        let conn = connect_with_retry(&self.inner.config.connection, &self.inner.config.retry).await?;
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Execute a simple query on a pooled connection.
    pub async fn simple_query(&self, query: &str) -> Result<Vec<QueryResult>> {
        let mut conn = self.acquire().await?;
        conn.simple_query(query).await
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, query: &str, params: &[PgValue]) -> Result<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.query(query, params).await
    }

    /// Execute a query without returning results (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, query: &str, params: &[PgValue]) -> Result<i64> {
        let mut conn = self.acquire().await?;
        conn.execute(query, params).await
    }

    /// Close the pool: idle connections are closed now, checked-out ones
    /// when they are returned. Further acquires fail with `PoolClosed`.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        self.inner.shutdown.cancel();

        let connections: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            idle.drain(..).collect()
        };
        for mut entry in connections {
            self.inner.total.fetch_sub(1, Ordering::Relaxed);
            let _ = entry.conn.close().await;
        }
        tracing::debug!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            total: inner.total.load(Ordering::Relaxed),
            idle: self.idle_count(),
            stale: inner.stale.load(Ordering::Relaxed),
            waiting: inner.waiting.load(Ordering::Relaxed),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Connect, retrying connection-level failures with backoff. Authentication
/// and server errors are returned immediately.
pub(crate) async fn connect_with_retry(config: &PgConfig, policy: &RetryPolicy) -> Result<PgConnection> {
    let mut attempt = 1;
    loop {
        match PgConnection::connect_with_config(config.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_connection_error() => {
                if !policy.should_retry(attempt) {
                    return Err(Error::ConnectionUnavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    addr = %config.addr(),
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
