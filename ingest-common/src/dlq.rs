//! # Dead letter queue
//!
//! Durable holding area for operations that could not be processed. Entries carry the full
//! operation, the error and a classification so that they can be inspected and replayed later.
//! The pipeline only ever appends; entries are removed by an explicit replay or operator action.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::filter::collection_of;
use crate::metrics_consts::{DLQ_BACKLOG, DLQ_WRITES};
use crate::pipeline::ProcessingError;
use crate::types::WireOperation;

/// Collection recorded for entries that never got as far as a parsed operation.
pub const UNKNOWN_COLLECTION: &str = "unknown";

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("{command} query failed with: {error}")]
    Database {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("dead letter store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize dead letter payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("dead letter {0} not found")]
    NotFound(Uuid),
    #[error("{0} is not a valid failure class")]
    ParseFailureClass(String),
}

/// Whether retrying the same payload can ever succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// The payload itself is bad. Replaying it unchanged will fail again.
    Permanent,
    /// Something downstream failed. Replay once it has recovered.
    Transient,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Permanent => "permanent",
            FailureClass::Transient => "transient",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = DeadLetterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(FailureClass::Permanent),
            "transient" => Ok(FailureClass::Transient),
            invalid => Err(DeadLetterError::ParseFailureClass(invalid.to_owned())),
        }
    }
}

/// What gets serialized into `event_data`: enough to run the operation through the pipeline
/// again. Frames that could not be decoded keep their raw text instead of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPayload {
    pub seq: i64,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<WireOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_frame: Option<String>,
}

impl DeadLetterPayload {
    pub fn for_operation(seq: i64, repo: &str, operation: &WireOperation) -> Self {
        Self {
            seq,
            repo: repo.to_owned(),
            operation: Some(operation.clone()),
            raw_frame: None,
        }
    }

    pub fn for_raw_frame(seq: i64, raw_frame: &str) -> Self {
        Self {
            seq,
            repo: String::new(),
            operation: None,
            raw_frame: Some(raw_frame.to_owned()),
        }
    }

    pub fn collection(&self) -> &str {
        match &self.operation {
            Some(op) => collection_of(&op.path),
            None => UNKNOWN_COLLECTION,
        }
    }
}

/// A row about to be inserted into the dead letter store.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub id: Uuid,
    pub seq: i64,
    pub repo: String,
    pub collection: String,
    pub payload: Value,
    pub error_message: String,
    pub error_type: FailureClass,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub seq: i64,
    pub repo: String,
    pub collection: String,
    pub payload: Value,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn decode_payload(&self) -> Result<DeadLetterPayload, DeadLetterError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: i64,
    pub offset: i64,
    pub collection: Option<String>,
    /// Only entries retried fewer than this many times.
    pub max_retry_count: Option<i32>,
    pub order: ListOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            collection: None,
            max_retry_count: None,
            order: ListOrder::NewestFirst,
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError>;

    async fn list(&self, options: &ListOptions) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// Bump `retry_count`, stamp `last_retry_at` and record the latest error.
    async fn mark_retried(
        &self,
        id: Uuid,
        error_message: &str,
        error_type: FailureClass,
    ) -> Result<(), DeadLetterError>;

    async fn delete(&self, id: Uuid) -> Result<(), DeadLetterError>;

    async fn count(&self) -> Result<i64, DeadLetterError>;
}

/// `firehose_dlq` table.
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
INSERT INTO firehose_dlq
    (id, seq, repo_id, event_type, event_data, error_message, error_type, retry_count, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.seq)
        .bind(&entry.repo)
        .bind(&entry.collection)
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .bind(entry.error_type.as_str())
        .bind(entry.retry_count)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::Database {
            command: "INSERT",
            error,
        })?;

        Ok(())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let order = match options.order {
            ListOrder::NewestFirst => "DESC",
            ListOrder::OldestFirst => "ASC",
        };

        let query = format!(
            r#"
SELECT
    id, seq, repo_id AS repo, event_type AS collection, event_data AS payload,
    error_message, error_type, retry_count, created_at, last_retry_at
FROM firehose_dlq
WHERE ($1::TEXT IS NULL OR event_type = $1)
    AND ($2::INTEGER IS NULL OR retry_count < $2)
ORDER BY created_at {order}, seq {order}
LIMIT $3 OFFSET $4
            "#
        );

        sqlx::query_as::<_, DeadLetterEntry>(&query)
            .bind(options.collection.as_deref())
            .bind(options.max_retry_count)
            .bind(options.limit)
            .bind(options.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DeadLetterError::Database {
                command: "SELECT",
                error,
            })
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        error_message: &str,
        error_type: FailureClass,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r#"
UPDATE firehose_dlq
SET retry_count = retry_count + 1, last_retry_at = NOW(), error_message = $2, error_type = $3
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(error_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::Database {
            command: "UPDATE",
            error,
        })?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), DeadLetterError> {
        let result = sqlx::query("DELETE FROM firehose_dlq WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| DeadLetterError::Database {
                command: "DELETE",
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        Ok(())
    }

    async fn count(&self) -> Result<i64, DeadLetterError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM firehose_dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DeadLetterError::Database {
                command: "COUNT",
                error,
            })
    }
}

/// Sole writer of dead letter entries.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    /// Persist a failed operation. An error here means the failure could not be recorded and
    /// must not be ignored by the caller.
    pub async fn add(
        &self,
        payload: DeadLetterPayload,
        error: &ProcessingError,
        retry_count: i32,
    ) -> Result<Uuid, DeadLetterError> {
        let id = Uuid::now_v7();
        let error_type = error.failure_class();
        let seq = payload.seq;

        let entry = NewDeadLetter {
            id,
            seq,
            repo: payload.repo.clone(),
            collection: payload.collection().to_owned(),
            payload: serde_json::to_value(&payload)?,
            error_message: error.to_string(),
            error_type,
            retry_count,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert(entry).await {
            error!(seq, "failed to write dead letter: {}", e);
            return Err(e);
        }

        metrics::counter!(DLQ_WRITES, "error_type" => error_type.as_str()).increment(1);
        debug!(seq, %id, %error_type, "operation dead lettered");

        Ok(id)
    }

    pub async fn list(&self, options: &ListOptions) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.store.list(options).await
    }

    pub async fn record_retry(
        &self,
        id: Uuid,
        error: &ProcessingError,
    ) -> Result<(), DeadLetterError> {
        self.store
            .mark_retried(id, &error.to_string(), error.failure_class())
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), DeadLetterError> {
        self.store.delete(id).await
    }

    /// Number of entries waiting, also published as a gauge.
    pub async fn backlog(&self) -> Result<i64, DeadLetterError> {
        let count = self.store.count().await?;
        metrics::gauge!(DLQ_BACKLOG).set(count as f64);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitError;
    use crate::sink::SinkError;
    use crate::testing::MemoryDeadLetterStore;
    use serde_json::json;

    fn operation(path: &str) -> WireOperation {
        WireOperation {
            action: "create".to_owned(),
            path: path.to_owned(),
            cid: Some("bafyrecord".to_owned()),
            record: Some(json!({
                "text": [{"$type": "text", "text": "hello "}, {"$type": "tag", "tag": "rust"}],
                "createdAt": "2024-05-01T12:00:00Z",
                "nested": {"values": [1, 2.5, null, true]}
            })),
        }
    }

    fn permanent() -> ProcessingError {
        ProcessingError::Commit(CommitError::MalformedPath("x".to_owned()))
    }

    fn transient() -> ProcessingError {
        ProcessingError::Sink {
            attempts: 3,
            source: SinkError::Unavailable {
                sink: "storage",
                message: "connection refused".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn test_add_then_list_round_trips_payload() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone());
        let op = operation("pub.example.post/3k2");

        let id = dlq
            .add(
                DeadLetterPayload::for_operation(17, "did:plc:alice", &op),
                &permanent(),
                0,
            )
            .await
            .unwrap();

        let entries = dlq.list(&ListOptions::default()).await.unwrap();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.seq, 17);
        assert_eq!(entry.repo, "did:plc:alice");
        assert_eq!(entry.collection, "pub.example.post");
        assert_eq!(entry.error_type, "permanent");
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.last_retry_at, None);

        let payload = entry.decode_payload().unwrap();
        assert_eq!(payload.operation.as_ref(), Some(&op));
        assert_eq!(payload.operation.unwrap().record, op.record);
    }

    #[tokio::test]
    async fn test_classification_follows_error() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone());

        dlq.add(
            DeadLetterPayload::for_operation(1, "did:plc:a", &operation("pub.example.post/1")),
            &transient(),
            0,
        )
        .await
        .unwrap();

        let entries = dlq.list(&ListOptions::default()).await.unwrap();
        assert_eq!(entries[0].error_type, "transient");
        assert!(entries[0].error_message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_reported() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        store.fail(true);
        let dlq = DeadLetterQueue::new(store.clone());

        let result = dlq
            .add(
                DeadLetterPayload::for_operation(1, "did:plc:a", &operation("pub.example.post/1")),
                &permanent(),
                0,
            )
            .await;

        assert!(matches!(result, Err(DeadLetterError::Unavailable(_))));
        store.fail(false);
        assert_eq!(dlq.backlog().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone());

        for seq in 1..=5 {
            let path = if seq % 2 == 0 {
                format!("pub.example.profile/{seq}")
            } else {
                format!("pub.example.post/{seq}")
            };
            dlq.add(
                DeadLetterPayload::for_operation(seq, "did:plc:a", &operation(&path)),
                &permanent(),
                0,
            )
            .await
            .unwrap();
        }

        let posts = dlq
            .list(&ListOptions {
                collection: Some("pub.example.post".to_owned()),
                order: ListOrder::OldestFirst,
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(
            posts.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );

        let page = dlq
            .list(&ListOptions {
                limit: 2,
                offset: 1,
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 3]);

        assert_eq!(dlq.backlog().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_record_retry_and_delete() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone());

        let id = dlq
            .add(
                DeadLetterPayload::for_operation(9, "did:plc:a", &operation("pub.example.post/9")),
                &permanent(),
                0,
            )
            .await
            .unwrap();

        dlq.record_retry(id, &transient()).await.unwrap();

        let entries = dlq.list(&ListOptions::default()).await.unwrap();
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[0].error_type, "transient");
        assert!(entries[0].last_retry_at.is_some());

        let retried_out = dlq
            .list(&ListOptions {
                max_retry_count: Some(1),
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert!(retried_out.is_empty());

        dlq.delete(id).await.unwrap();
        assert_eq!(dlq.backlog().await.unwrap(), 0);
        assert!(matches!(
            dlq.delete(id).await,
            Err(DeadLetterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_frame_entry() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone());

        dlq.add(
            DeadLetterPayload::for_raw_frame(33, r#"{"seq":33,"ops":5}"#),
            &ProcessingError::MalformedFrame("invalid type".to_owned()),
            0,
        )
        .await
        .unwrap();

        let entry = &dlq.list(&ListOptions::default()).await.unwrap()[0];
        assert_eq!(entry.collection, UNKNOWN_COLLECTION);
        assert_eq!(entry.error_type, "permanent");
        assert_eq!(
            entry.decode_payload().unwrap().raw_frame.as_deref(),
            Some(r#"{"seq":33,"ops":5}"#)
        );
    }

    #[test]
    fn test_failure_class_parse() {
        assert_eq!("permanent".parse::<FailureClass>().unwrap(), FailureClass::Permanent);
        assert_eq!("transient".parse::<FailureClass>().unwrap(), FailureClass::Transient);
        assert!("sometimes".parse::<FailureClass>().is_err());
    }
}
