//! # Resilient persistence layer
//!
//! Every ingestion path writes through [`ResilientStore`]: a bounded
//! connection pool plus bounded exponential-backoff retry for
//! connection-class failures. Data errors are surfaced immediately; only a
//! broken/lost connection triggers the retry path, which discards the dead
//! connection, recreates the pool, and tries again up to the configured
//! attempt cap.
//!
//! Each [`ResilientStore::execute`] call commits independently. There is no
//! transaction spanning a node upsert and a metric insert, so a failure
//! between two related writes leaves a self-consistent but partial state;
//! callers must not assume atomicity across calls.

pub mod sled_backend;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::{NodeRecord, PacketMetricRow, Position};

pub use sled_backend::SledBackend;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient connectivity loss; the only retryable class.
    #[error("connection error: {0}")]
    Connection(String),

    /// Concurrent duplicate insert on a unique key; benign for callers.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Non-retryable backend fault (corruption, unsupported operation).
    #[error("backend error: {0}")]
    Backend(String),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for failures worth a pooled retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => StoreError::Connection(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Partial update of a node's mutable descriptive fields. Name fields are
/// deliberately absent: names only change through the conditional promotion
/// path.
#[derive(Debug, Clone, Default)]
pub struct NodeRefresh {
    pub hardware_model: Option<String>,
    pub role: Option<String>,
    pub position: Option<Position>,
    pub mqtt_status: Option<String>,
}

/// A single checked-out connection's operation surface.
pub trait StoreConn: Send {
    fn get_node(&mut self, node_id: u32) -> Result<Option<NodeRecord>, StoreError>;

    /// Insert a fresh row. Returns `false` when the row already exists
    /// (duplicate insert race, treated as benign).
    fn insert_node(&mut self, record: &NodeRecord) -> Result<bool, StoreError>;

    /// Conditionally replace the stored names: the write applies only while
    /// the currently stored names are still placeholder-shaped. Returns
    /// whether the promotion was applied. This is the guarantee that makes
    /// direct upserts and reconcile sweeps commutative.
    fn promote_node_names(
        &mut self,
        node_id: u32,
        long_name: &str,
        short_name: &str,
    ) -> Result<bool, StoreError>;

    /// Refresh descriptive fields on an existing row, independent of name
    /// promotion. Returns `false` when the row does not exist.
    fn refresh_node(&mut self, node_id: u32, update: &NodeRefresh) -> Result<bool, StoreError>;

    /// Append one packet metric row.
    fn insert_metric(&mut self, row: &PacketMetricRow) -> Result<(), StoreError>;

    fn node_count(&mut self) -> Result<u64, StoreError>;

    fn metric_count(&mut self) -> Result<u64, StoreError>;

    /// Cheap liveness round-trip with no side effects.
    fn ping(&mut self) -> Result<(), StoreError>;
}

/// Connection factory; the seam integration tests use to inject failing
/// backends.
pub trait StoreBackend: Send + Sync + 'static {
    type Conn: StoreConn + 'static;

    fn connect(&self) -> Result<Self::Conn, StoreError>;
}

/// Bounded exponential backoff: base delay doubling (by `multiplier`) each
/// attempt, capped by `max_delay`, at most `max_attempts` total attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number `attempt`
    /// (zero-based: the first retry waits `base_delay`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt) as u128;
        let millis = self
            .base_delay
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());
        Duration::from_millis(millis as u64)
    }
}

/// Pool sizing and connect behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 20,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Pool<B: StoreBackend> {
    backend: B,
    cfg: PoolConfig,
    idle: Mutex<Vec<B::Conn>>,
    permits: Arc<Semaphore>,
    generation: AtomicU64,
}

impl<B: StoreBackend> Pool<B> {
    fn new(backend: B, cfg: PoolConfig) -> Result<Self, StoreError> {
        let mut idle = Vec::with_capacity(cfg.min_size);
        for _ in 0..cfg.min_size.min(cfg.max_size) {
            idle.push(backend.connect()?);
        }
        Ok(Self {
            backend,
            permits: Arc::new(Semaphore::new(cfg.max_size.max(1))),
            idle: Mutex::new(idle),
            cfg,
            generation: AtomicU64::new(0),
        })
    }

    async fn checkout(&self) -> Result<PooledConn<'_, B>, StoreError> {
        let permit = tokio::time::timeout(self.cfg.connect_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| StoreError::Connection("timed out waiting for a pooled connection".to_string()))?
            .map_err(|_| StoreError::Connection("connection pool closed".to_string()))?;
        let generation = self.generation.load(Ordering::Acquire);
        let reused = self.idle.lock().expect("pool mutex poisoned").pop();
        let conn = match reused {
            Some(conn) => conn,
            // Permit is dropped on the error path, releasing the slot.
            None => self.backend.connect()?,
        };
        Ok(PooledConn {
            pool: self,
            conn: Some(conn),
            generation,
            discard: false,
            _permit: permit,
        })
    }

    /// Discard every idle connection and invalidate outstanding checkouts so
    /// their connections are dropped on release instead of checked back in.
    fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.idle.lock().expect("pool mutex poisoned").clear();
    }
}

/// Checked-out connection. Dropping the guard returns the connection to the
/// pool on every exit path; [`PooledConn::discard`] drops it instead.
pub struct PooledConn<'a, B: StoreBackend> {
    pool: &'a Pool<B>,
    conn: Option<B::Conn>,
    generation: u64,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<B: StoreBackend> PooledConn<'_, B> {
    fn discard(mut self) {
        self.discard = true;
    }
}

impl<B: StoreBackend> Deref for PooledConn<'_, B> {
    type Target = B::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl<B: StoreBackend> DerefMut for PooledConn<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl<B: StoreBackend> Drop for PooledConn<'_, B> {
    fn drop(&mut self) {
        if self.discard || self.generation != self.pool.generation.load(Ordering::Acquire) {
            return;
        }
        if let (Some(conn), Ok(mut idle)) = (self.conn.take(), self.pool.idle.lock()) {
            idle.push(conn);
        }
    }
}

/// Pooled, retrying persistence primitive.
pub struct ResilientStore<B: StoreBackend> {
    pool: Pool<B>,
    retry: RetryPolicy,
}

impl<B: StoreBackend> ResilientStore<B> {
    pub fn new(backend: B, pool: PoolConfig, retry: RetryPolicy) -> Result<Self, StoreError> {
        Ok(Self {
            pool: Pool::new(backend, pool)?,
            retry,
        })
    }

    /// Run `op` on a pooled connection. On a connection-class failure the
    /// dead connection is discarded, the pool recreated, and the operation
    /// retried with exponential backoff; the error from the final attempt is
    /// surfaced. Non-connection errors surface immediately.
    pub async fn execute<T, F>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut B::Conn) -> Result<T, StoreError>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.pool.checkout().await {
                Ok(mut conn) => match op(&mut conn) {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if err.is_connection() {
                            conn.discard();
                        }
                        err
                    }
                },
                Err(err) => err,
            };
            if !err.is_connection() {
                return Err(err);
            }
            attempt += 1;
            if attempt >= self.retry.max_attempts {
                error!(
                    "store operation failed after {} attempts: {}",
                    attempt, err
                );
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt - 1);
            warn!(
                "store connection error (attempt {}/{}): {}; retrying in {:?}",
                attempt, self.retry.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            self.pool.reset();
        }
    }

    /// Liveness probe: one ping round-trip, no retries, no side effects.
    pub async fn health(&self) -> bool {
        match self.pool.checkout().await {
            Ok(mut conn) => match conn.ping() {
                Ok(()) => true,
                Err(err) => {
                    debug!("health probe failed: {}", err);
                    conn.discard();
                    false
                }
            },
            Err(err) => {
                debug!("health probe could not check out a connection: {}", err);
                false
            }
        }
    }

    /// Drop all pooled connections so the next checkout reconnects. Used by
    /// the health supervisor once consecutive probe failures cross the
    /// configured threshold.
    pub fn reset_pool(&self) {
        self.pool.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2,
            max_delay: Duration::from_millis(450),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(450));
        assert_eq!(policy.delay_for(10), Duration::from_millis(450));
    }

    #[test]
    fn retry_delay_tolerates_zero_multiplier() {
        let policy = RetryPolicy {
            multiplier: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), policy.base_delay);
    }

    /// Backend whose connections fail the first `failures` operations with a
    /// connection-class error, then succeed.
    struct FlakyBackend {
        failures: Arc<AtomicU32>,
        ops: Arc<AtomicU32>,
    }

    struct FlakyConn {
        failures: Arc<AtomicU32>,
        ops: Arc<AtomicU32>,
    }

    impl FlakyConn {
        fn attempt(&self) -> Result<(), StoreError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Connection("simulated drop".to_string()));
            }
            Ok(())
        }
    }

    impl StoreConn for FlakyConn {
        fn get_node(&mut self, _node_id: u32) -> Result<Option<NodeRecord>, StoreError> {
            self.attempt().map(|_| None)
        }
        fn insert_node(&mut self, _record: &NodeRecord) -> Result<bool, StoreError> {
            self.attempt().map(|_| true)
        }
        fn promote_node_names(&mut self, _n: u32, _l: &str, _s: &str) -> Result<bool, StoreError> {
            self.attempt().map(|_| false)
        }
        fn refresh_node(&mut self, _n: u32, _u: &NodeRefresh) -> Result<bool, StoreError> {
            self.attempt().map(|_| false)
        }
        fn insert_metric(&mut self, _row: &PacketMetricRow) -> Result<(), StoreError> {
            self.attempt()
        }
        fn node_count(&mut self) -> Result<u64, StoreError> {
            self.attempt().map(|_| 0)
        }
        fn metric_count(&mut self) -> Result<u64, StoreError> {
            self.attempt().map(|_| 0)
        }
        fn ping(&mut self) -> Result<(), StoreError> {
            self.attempt()
        }
    }

    impl StoreBackend for FlakyBackend {
        type Conn = FlakyConn;

        fn connect(&self) -> Result<Self::Conn, StoreError> {
            Ok(FlakyConn {
                failures: self.failures.clone(),
                ops: self.ops.clone(),
            })
        }
    }

    fn flaky_store(failures: u32, max_attempts: u32) -> (ResilientStore<FlakyBackend>, Arc<AtomicU32>) {
        let ops = Arc::new(AtomicU32::new(0));
        let backend = FlakyBackend {
            failures: Arc::new(AtomicU32::new(failures)),
            ops: ops.clone(),
        };
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            multiplier: 2,
            max_delay: Duration::from_millis(100),
        };
        let store = ResilientStore::new(backend, PoolConfig::default(), retry).expect("store");
        (store, ops)
    }

    #[tokio::test(start_paused = true)]
    async fn execute_recovers_after_one_shot_drop() {
        let (store, ops) = flaky_store(1, 5);
        store.execute(|conn| conn.ping()).await.expect("recovered");
        assert_eq!(ops.load(Ordering::SeqCst), 2, "one failure, one retry");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_surfaces_error_after_exhausting_attempts() {
        let (store, ops) = flaky_store(10, 3);
        let err = store
            .execute(|conn| conn.ping())
            .await
            .expect_err("should exhaust");
        assert!(err.is_connection());
        assert_eq!(ops.load(Ordering::SeqCst), 3, "exactly max_attempts tries");
        // No further attempts after surfacing.
        assert_eq!(ops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_connection_errors_are_not_retried() {
        let (store, ops) = flaky_store(0, 5);
        let err = store
            .execute(|_conn| -> Result<(), StoreError> {
                Err(StoreError::Integrity("duplicate node".to_string()))
            })
            .await
            .expect_err("integrity error surfaces");
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(ops.load(Ordering::SeqCst), 0);
    }
}
