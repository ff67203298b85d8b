//! # Cursor
//!
//! Durable progress marker for one logical consumer, keyed by service name.
//!
//! Updates are not written through. They accumulate until `batch_size` updates have been
//! recorded, until `flush_interval` elapses, or until the manager is closed, whichever happens
//! first. A crash therefore loses at most one unflushed batch, and those events are delivered
//! again on restart, which downstream writes tolerate because they are idempotent.
//!
//! Every flush upserts the durable row and then mirrors the value into a cache entry with a
//! TTL. The durable row is authoritative: reads for recovery never consult the cache.
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics_consts::{
    CURSOR_CACHE_ERRORS, CURSOR_FLUSHES, CURSOR_FLUSH_ERRORS, CURSOR_SEQUENCE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub sequence: i64,
    pub last_updated: DateTime<Utc>,
}

/// Errors from the durable cursor store.
#[derive(Error, Debug)]
pub enum CursorStoreError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the cursor cache mirror. Never fatal.
#[derive(Error, Debug)]
pub enum CursorCacheError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("cursor cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor for {service_name} cannot move back from {current} to {attempted}")]
    Regression {
        service_name: String,
        current: i64,
        attempted: i64,
    },
    #[error("cursor manager for {0} is closed")]
    Closed(String),
    #[error(transparent)]
    Store(#[from] CursorStoreError),
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, service_name: &str) -> Result<Option<CursorPosition>, CursorStoreError>;

    async fn upsert(
        &self,
        service_name: &str,
        sequence: i64,
    ) -> Result<CursorPosition, CursorStoreError>;
}

#[async_trait]
pub trait CursorCache: Send + Sync {
    async fn mirror(&self, key: &str, sequence: i64, ttl: Duration)
        -> Result<(), CursorCacheError>;
}

/// `firehose_cursor` table, one row per service name.
#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(&self, service_name: &str) -> Result<Option<CursorPosition>, CursorStoreError> {
        let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT cursor_seq, last_updated FROM firehose_cursor WHERE service_name = $1",
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| CursorStoreError::Query {
            command: "SELECT",
            error,
        })?;

        Ok(row.map(|(sequence, last_updated)| CursorPosition {
            sequence,
            last_updated,
        }))
    }

    async fn upsert(
        &self,
        service_name: &str,
        sequence: i64,
    ) -> Result<CursorPosition, CursorStoreError> {
        let (sequence, last_updated): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
INSERT INTO firehose_cursor (service_name, cursor_seq, last_updated)
VALUES ($1, $2, NOW())
ON CONFLICT (service_name)
DO UPDATE SET cursor_seq = EXCLUDED.cursor_seq, last_updated = EXCLUDED.last_updated
RETURNING cursor_seq, last_updated
            "#,
        )
        .bind(service_name)
        .bind(sequence)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| CursorStoreError::Query {
            command: "UPSERT",
            error,
        })?;

        Ok(CursorPosition {
            sequence,
            last_updated,
        })
    }
}

#[derive(Clone)]
pub struct RedisCursorCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCursorCache {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CursorCache for RedisCursorCache {
    async fn mirror(
        &self,
        key: &str,
        sequence: i64,
        ttl: Duration,
    ) -> Result<(), CursorCacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, sequence.to_string(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

/// Used when no cache is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCursorCache;

#[async_trait]
impl CursorCache for NoopCursorCache {
    async fn mirror(&self, _: &str, _: i64, _: Duration) -> Result<(), CursorCacheError> {
        Ok(())
    }
}

pub fn cache_key(service_name: &str) -> String {
    format!("cursor:{service_name}")
}

#[derive(Clone, Debug)]
pub struct CursorSettings {
    /// Flush after this many updates. Zero is treated as one.
    pub batch_size: usize,
    /// Flush pending updates at least this often. Zero disables the periodic flush.
    pub flush_interval: Duration,
    pub cache_ttl: Duration,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct CursorState {
    /// Highest sequence handed to `update_cursor`.
    recorded: Option<i64>,
    /// Highest sequence known to be in the durable store.
    flushed: Option<i64>,
    pending_updates: usize,
    closed: bool,
}

struct CursorInner {
    service_name: String,
    cache_key: String,
    store: Arc<dyn CursorStore>,
    cache: Arc<dyn CursorCache>,
    settings: CursorSettings,
    state: Mutex<CursorState>,
}

impl CursorInner {
    /// Write the recorded sequence if it is ahead of the durable copy. On failure the pending
    /// state is kept so the next trigger retries it.
    async fn flush(&self, state: &mut CursorState) -> Result<bool, CursorError> {
        let Some(sequence) = state.recorded else {
            return Ok(false);
        };

        if state.flushed == Some(sequence) {
            state.pending_updates = 0;
            return Ok(false);
        }

        if let Err(e) = self.store.upsert(&self.service_name, sequence).await {
            metrics::counter!(CURSOR_FLUSH_ERRORS).increment(1);
            return Err(e.into());
        }

        state.flushed = Some(sequence);
        state.pending_updates = 0;

        metrics::counter!(CURSOR_FLUSHES).increment(1);
        metrics::gauge!(CURSOR_SEQUENCE, "service" => self.service_name.clone())
            .set(sequence as f64);

        if let Err(e) = self
            .cache
            .mirror(&self.cache_key, sequence, self.settings.cache_ttl)
            .await
        {
            metrics::counter!(CURSOR_CACHE_ERRORS).increment(1);
            warn!("failed to mirror cursor {} into cache: {}", sequence, e);
        }

        debug!(service = %self.service_name, sequence, "flushed cursor");

        Ok(true)
    }
}

struct Flusher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Sole writer of cursor state for a service name.
pub struct CursorManager {
    inner: Arc<CursorInner>,
    flusher: StdMutex<Option<Flusher>>,
}

impl CursorManager {
    /// Build a manager and start its periodic flush task. Must be called from within a Tokio
    /// runtime.
    pub fn new(
        service_name: &str,
        store: Arc<dyn CursorStore>,
        cache: Arc<dyn CursorCache>,
        settings: CursorSettings,
    ) -> Self {
        let inner = Arc::new(CursorInner {
            service_name: service_name.to_owned(),
            cache_key: cache_key(service_name),
            store,
            cache,
            settings,
            state: Mutex::new(CursorState::default()),
        });

        let flusher = if inner.settings.flush_interval.is_zero() {
            None
        } else {
            let (shutdown, receiver) = watch::channel(false);
            let handle = tokio::spawn(run_periodic_flush(inner.clone(), receiver));
            Some(Flusher { shutdown, handle })
        };

        Self {
            inner,
            flusher: StdMutex::new(flusher),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Record that everything up to and including `sequence` has been handled.
    pub async fn update_cursor(&self, sequence: i64) -> Result<(), CursorError> {
        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Err(CursorError::Closed(self.inner.service_name.clone()));
        }

        if let Some(current) = state.recorded {
            if sequence < current {
                return Err(CursorError::Regression {
                    service_name: self.inner.service_name.clone(),
                    current,
                    attempted: sequence,
                });
            }
        }

        state.recorded = Some(sequence);
        state.pending_updates += 1;

        if state.pending_updates >= self.inner.settings.batch_size.max(1) {
            self.inner.flush(&mut state).await?;
        }

        Ok(())
    }

    /// Read the durable store directly, bypassing both the cache and any unflushed updates.
    pub async fn get_current_cursor(&self) -> Result<Option<CursorPosition>, CursorError> {
        Ok(self.inner.store.load(&self.inner.service_name).await?)
    }

    /// Start tracking from a sequence that is already durable, without writing it again.
    /// Has no effect once updates have been recorded.
    pub async fn seed(&self, sequence: i64) {
        let mut state = self.inner.state.lock().await;
        if state.recorded.is_none() {
            state.recorded = Some(sequence);
            state.flushed = Some(sequence);
        }
    }

    /// Highest sequence recorded so far, flushed or not.
    pub async fn last_recorded(&self) -> Option<i64> {
        self.inner.state.lock().await.recorded
    }

    /// Number of updates recorded since the last successful flush.
    pub async fn pending_updates(&self) -> usize {
        self.inner.state.lock().await.pending_updates
    }

    /// Flush now, regardless of batch size or interval. Returns whether anything was written.
    pub async fn flush(&self) -> Result<bool, CursorError> {
        let mut state = self.inner.state.lock().await;
        self.inner.flush(&mut state).await
    }

    /// Stop the periodic flush and write any pending update one last time. Calling `close`
    /// again after a successful close does nothing.
    pub async fn close(&self) -> Result<(), CursorError> {
        let flusher = match self.flusher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(flusher) = flusher {
            // The task may already be gone, in which case there is nobody to notify.
            let _ = flusher.shutdown.send(true);
            if let Err(e) = flusher.handle.await {
                warn!("cursor flush task ended abnormally: {}", e);
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Ok(());
        }

        self.inner.flush(&mut state).await?;
        state.closed = true;

        info!(
            service = %self.inner.service_name,
            sequence = ?state.flushed,
            "cursor manager closed"
        );

        Ok(())
    }
}

impl Drop for CursorManager {
    fn drop(&mut self) {
        let flusher = match self.flusher.get_mut() {
            Ok(flusher) => flusher.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(flusher) = flusher {
            flusher.handle.abort();
        }
    }
}

async fn run_periodic_flush(inner: Arc<CursorInner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.settings.flush_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut state = inner.state.lock().await;
                if state.closed {
                    return;
                }
                if let Err(e) = inner.flush(&mut state).await {
                    warn!("periodic cursor flush failed: {}", e);
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
