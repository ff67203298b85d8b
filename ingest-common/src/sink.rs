//! # Sink
//!
//! Narrow contracts for the stores that receive canonical records. The pipeline only ever asks
//! for upserts and deletes by identity, and every implementation must make repeating either one
//! harmless, since events are delivered at least once.
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;

use crate::metrics_consts::CACHE_INVALIDATION_ERRORS;
use crate::transform::{CanonicalRecord, RecordBody, RecordKind};
use crate::types::RecordRef;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{command} query failed with: {error}")]
    Database {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error(transparent)]
    Cache(#[from] redis::RedisError),
    #[error("{sink} sink unavailable: {message}")]
    Unavailable { sink: &'static str, message: String },
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the pipeline hands to a sink for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexChange {
    Upsert(CanonicalRecord),
    Delete { target: RecordRef, kind: RecordKind },
}

impl IndexChange {
    pub fn uri(&self) -> String {
        match self {
            IndexChange::Upsert(record) => record.uri.clone(),
            IndexChange::Delete { target, .. } => target.uri(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            IndexChange::Upsert(record) => record.kind(),
            IndexChange::Delete { kind, .. } => *kind,
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            IndexChange::Upsert(record) => &record.repo,
            IndexChange::Delete { target, .. } => &target.repo,
        }
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn apply(&self, change: &IndexChange) -> Result<(), SinkError>;
}

#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), SinkError>;

    async fn delete(&self, target: &RecordRef) -> Result<(), SinkError>;
}

#[async_trait]
pub trait SearchSink: Send + Sync {
    async fn index(&self, record: &CanonicalRecord) -> Result<(), SinkError>;

    async fn delete(&self, uri: &str) -> Result<(), SinkError>;
}

/// Repositories are nodes; follows are edges identified by the follow record's URI.
#[async_trait]
pub trait GraphSink: Send + Sync {
    async fn upsert_node(&self, repo: &str, record: &CanonicalRecord) -> Result<(), SinkError>;

    async fn delete_node(&self, repo: &str) -> Result<(), SinkError>;

    async fn upsert_edge(&self, from: &str, to: &str, uri: &str) -> Result<(), SinkError>;

    async fn delete_edge(&self, uri: &str) -> Result<(), SinkError>;
}

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, keys: &[String]) -> Result<(), SinkError>;
}

pub fn record_cache_key(uri: &str) -> String {
    format!("record:{uri}")
}

pub fn profile_cache_key(repo: &str) -> String {
    format!("profile:{repo}")
}

/// Applies a change to storage, search and graph in that order, then invalidates cached reads.
/// The first failing store fails the whole change; invalidation failures are only logged since
/// cached entries expire on their own.
pub struct FanOutSink {
    storage: Arc<dyn StorageSink>,
    search: Arc<dyn SearchSink>,
    graph: Arc<dyn GraphSink>,
    cache: Arc<dyn CacheInvalidator>,
}

impl FanOutSink {
    pub fn new(
        storage: Arc<dyn StorageSink>,
        search: Arc<dyn SearchSink>,
        graph: Arc<dyn GraphSink>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            storage,
            search,
            graph,
            cache,
        }
    }

    /// Storage only, for deployments without search, graph or cache.
    pub fn storage_only(storage: Arc<dyn StorageSink>) -> Self {
        Self::new(
            storage,
            Arc::new(NoopSearchSink),
            Arc::new(NoopGraphSink),
            Arc::new(NoopCacheInvalidator),
        )
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        self.storage.upsert(record).await?;
        self.search.index(record).await?;

        match &record.body {
            RecordBody::Follow(follow) => {
                self.graph
                    .upsert_edge(&record.repo, &follow.subject, &record.uri)
                    .await?
            }
            RecordBody::Profile(_) => self.graph.upsert_node(&record.repo, record).await?,
            RecordBody::Post(_) | RecordBody::Other { .. } => {}
        }

        Ok(())
    }

    async fn delete(&self, target: &RecordRef, kind: RecordKind) -> Result<(), SinkError> {
        let uri = target.uri();

        self.storage.delete(target).await?;
        self.search.delete(&uri).await?;

        match kind {
            RecordKind::Follow => self.graph.delete_edge(&uri).await?,
            RecordKind::Profile => self.graph.delete_node(&target.repo).await?,
            RecordKind::Post | RecordKind::Other => {}
        }

        Ok(())
    }

    async fn invalidate(&self, change: &IndexChange) {
        let mut keys = vec![record_cache_key(&change.uri())];
        if change.kind() == RecordKind::Profile {
            keys.push(profile_cache_key(change.repo()));
        }

        if let Err(e) = self.cache.invalidate(&keys).await {
            metrics::counter!(CACHE_INVALIDATION_ERRORS).increment(1);
            warn!("failed to invalidate cached reads for {}: {}", change.uri(), e);
        }
    }
}

#[async_trait]
impl RecordSink for FanOutSink {
    async fn apply(&self, change: &IndexChange) -> Result<(), SinkError> {
        match change {
            IndexChange::Upsert(record) => self.upsert(record).await?,
            IndexChange::Delete { target, kind } => self.delete(target, *kind).await?,
        }

        self.invalidate(change).await;

        Ok(())
    }
}

/// `indexed_records` table keyed by record URI.
#[derive(Clone)]
pub struct PgStorageSink {
    pool: PgPool,
}

impl PgStorageSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageSink for PgStorageSink {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        let body = serde_json::to_value(&record.body)?;

        sqlx::query(
            r#"
INSERT INTO indexed_records (uri, repo_id, collection, rkey, cid, body, text, created_at, indexed_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
ON CONFLICT (uri)
DO UPDATE SET
    cid = EXCLUDED.cid,
    body = EXCLUDED.body,
    text = EXCLUDED.text,
    created_at = EXCLUDED.created_at,
    indexed_at = EXCLUDED.indexed_at
            "#,
        )
        .bind(&record.uri)
        .bind(&record.repo)
        .bind(&record.collection)
        .bind(&record.rkey)
        .bind(&record.cid)
        .bind(body)
        .bind(&record.text)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|error| SinkError::Database {
            command: "UPSERT",
            error,
        })?;

        Ok(())
    }

    async fn delete(&self, target: &RecordRef) -> Result<(), SinkError> {
        sqlx::query("DELETE FROM indexed_records WHERE uri = $1")
            .bind(target.uri())
            .execute(&self.pool)
            .await
            .map_err(|error| SinkError::Database {
                command: "DELETE",
                error,
            })?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisCacheInvalidator {
    conn: redis::aio::ConnectionManager,
}

impl RedisCacheInvalidator {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidator {
    async fn invalidate(&self, keys: &[String]) -> Result<(), SinkError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSearchSink;

#[async_trait]
impl SearchSink for NoopSearchSink {
    async fn index(&self, _: &CanonicalRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete(&self, _: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopGraphSink;

#[async_trait]
impl GraphSink for NoopGraphSink {
    async fn upsert_node(&self, _: &str, _: &CanonicalRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete_node(&self, _: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn upsert_edge(&self, _: &str, _: &str, _: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete_edge(&self, _: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _: &[String]) -> Result<(), SinkError> {
        Ok(())
    }
}
