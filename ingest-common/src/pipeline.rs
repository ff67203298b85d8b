//! # Pipeline
//!
//! Runs one operation through filter, validation, transform and sink. Used both by the live
//! consumer and by DLQ replay so that a replayed operation takes exactly the same path.
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::commit::{CommitError, CommitHandler};
use crate::dlq::FailureClass;
use crate::filter::EventFilter;
use crate::metrics_consts::{OPERATIONS_TOTAL, OPERATION_DURATION, SINK_RETRIES};
use crate::sink::{IndexChange, RecordSink, SinkError};
use crate::transform::{RecordTransformer, TransformError};
use crate::types::{Action, WireOperation};

/// Every way a single operation can fail. None of these stop the stream.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("invalid operation: {0}")]
    Commit(#[from] CommitError),
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("sink failed after {attempts} attempts: {source}")]
    Sink { attempts: u32, source: SinkError },
    #[error("undecodable frame: {0}")]
    MalformedFrame(String),
}

impl ProcessingError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ProcessingError::Commit(_)
            | ProcessingError::Transform(_)
            | ProcessingError::MalformedFrame(_) => FailureClass::Permanent,
            ProcessingError::Sink { .. } => FailureClass::Transient,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ProcessingError::Commit(_) => "invalid",
            ProcessingError::Transform(_) => "transform_failed",
            ProcessingError::Sink { .. } => "sink_failed",
            ProcessingError::MalformedFrame(_) => "malformed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Indexed,
    Deleted,
    /// Not for this index. Still counts as handled.
    Filtered,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Indexed => "indexed",
            Outcome::Deleted => "deleted",
            Outcome::Filtered => "filtered",
        }
    }
}

/// Inline retries of a failing sink call before the operation is dead lettered.
#[derive(Debug, Clone, Copy)]
pub struct SinkRetry {
    pub max_retries: u32,
    /// Base delay, doubled after every attempt.
    pub interval: Duration,
}

impl Default for SinkRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_millis(100),
        }
    }
}

pub struct OperationProcessor {
    filter: EventFilter,
    handler: CommitHandler,
    transformer: RecordTransformer,
    sink: Arc<dyn RecordSink>,
    sink_retry: SinkRetry,
}

impl OperationProcessor {
    pub fn new(
        filter: EventFilter,
        transformer: RecordTransformer,
        sink: Arc<dyn RecordSink>,
        sink_retry: SinkRetry,
    ) -> Self {
        Self {
            filter,
            handler: CommitHandler::new(),
            transformer,
            sink,
            sink_retry,
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub async fn process(
        &self,
        seq: i64,
        repo: &str,
        op: &WireOperation,
    ) -> Result<Outcome, ProcessingError> {
        let start = Instant::now();
        let result = self.run(seq, repo, op).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(OPERATIONS_TOTAL, "outcome" => label).increment(1);
        metrics::histogram!(OPERATION_DURATION).record(start.elapsed().as_millis() as f64);

        result
    }

    async fn run(
        &self,
        seq: i64,
        repo: &str,
        op: &WireOperation,
    ) -> Result<Outcome, ProcessingError> {
        if !self.filter.should_process(&op.path) {
            return Ok(Outcome::Filtered);
        }

        let parsed = self.handler.parse_operation(seq, repo, op)?;

        let change = match (parsed.action, parsed.record, parsed.cid) {
            (Action::Delete, _, _) => IndexChange::Delete {
                kind: self.transformer.kind_of(&parsed.target.collection),
                target: parsed.target,
            },
            (Action::Create | Action::Update, Some(record), Some(cid)) => {
                IndexChange::Upsert(self.transformer.transform(&parsed.target, &record, &cid)?)
            }
            (action, _, _) => {
                // parse_operation has already checked the shape.
                return Err(ProcessingError::Commit(CommitError::InvalidPayload {
                    action,
                    path: op.path.clone(),
                    expected: "both a payload and a content hash",
                }));
            }
        };

        self.apply_with_retry(seq, &change).await?;

        debug!(seq, uri = %change.uri(), "operation applied");

        Ok(match change {
            IndexChange::Upsert(_) => Outcome::Indexed,
            IndexChange::Delete { .. } => Outcome::Deleted,
        })
    }

    async fn apply_with_retry(&self, seq: i64, change: &IndexChange) -> Result<(), ProcessingError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.sink.apply(change).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt > self.sink_retry.max_retries => {
                    return Err(ProcessingError::Sink {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    metrics::counter!(SINK_RETRIES).increment(1);
                    let delay = self
                        .sink_retry
                        .interval
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        seq,
                        attempt,
                        "sink rejected {}, retrying in {:?}: {}",
                        change.uri(),
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, SinkCall};
    use crate::transform::RecordKind;
    use serde_json::json;

    fn processor(sink: &Arc<RecordingSink>, max_retries: u32) -> OperationProcessor {
        OperationProcessor::new(
            EventFilter::with_allowlist(
                "pub.example",
                ["pub.example.post", "pub.example.follow"],
            ),
            RecordTransformer::new("pub.example"),
            sink.clone(),
            SinkRetry {
                max_retries,
                interval: Duration::from_millis(10),
            },
        )
    }

    fn create(path: &str, record: serde_json::Value) -> WireOperation {
        WireOperation {
            action: "create".to_owned(),
            path: path.to_owned(),
            cid: Some("bafy".to_owned()),
            record: Some(record),
        }
    }

    #[tokio::test]
    async fn test_create_is_indexed() {
        let sink = Arc::new(RecordingSink::new());

        let outcome = processor(&sink, 0)
            .process(
                1,
                "did:plc:alice",
                &create(
                    "pub.example.post/1",
                    json!({"text": "hi", "createdAt": "2024-05-01T12:00:00Z"}),
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Indexed);
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        let SinkCall::Apply(IndexChange::Upsert(record)) = &calls[0] else {
            panic!("expected an upsert");
        };
        assert_eq!(record.text, "hi");
    }

    #[tokio::test]
    async fn test_delete_carries_kind() {
        let sink = Arc::new(RecordingSink::new());
        let op = WireOperation {
            action: "delete".to_owned(),
            path: "pub.example.follow/1".to_owned(),
            cid: None,
            record: None,
        };

        let outcome = processor(&sink, 0)
            .process(2, "did:plc:alice", &op)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        assert!(matches!(
            &sink.calls()[0],
            SinkCall::Apply(IndexChange::Delete {
                kind: RecordKind::Follow,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_filtered_never_reaches_sink() {
        let sink = Arc::new(RecordingSink::new());

        let outcome = processor(&sink, 0)
            .process(3, "did:plc:alice", &create("pub.example.profile/self", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Filtered);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_validation_and_transform_failures_are_permanent() {
        let sink = Arc::new(RecordingSink::new());
        let processor = processor(&sink, 0);

        let invalid = WireOperation {
            action: "create".to_owned(),
            path: "pub.example.post/1".to_owned(),
            cid: None,
            record: Some(json!({})),
        };
        let err = processor.process(4, "did:plc:alice", &invalid).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Commit(_)));
        assert_eq!(err.failure_class(), FailureClass::Permanent);

        let err = processor
            .process(5, "did:plc:alice", &create("pub.example.post/1", json!({"text": "hi"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Transform(_)));
        assert_eq!(err.failure_class(), FailureClass::Permanent);

        assert!(sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_is_retried_inline() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_next(2);

        let outcome = processor(&sink, 3)
            .process(
                6,
                "did:plc:alice",
                &create(
                    "pub.example.post/1",
                    json!({"text": "hi", "createdAt": "2024-05-01T12:00:00Z"}),
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Indexed);
        assert_eq!(sink.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_after_retries_is_transient() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_always(true);

        let err = processor(&sink, 2)
            .process(
                7,
                "did:plc:alice",
                &create(
                    "pub.example.post/1",
                    json!({"text": "hi", "createdAt": "2024-05-01T12:00:00Z"}),
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::Sink { attempts: 3, .. }));
        assert_eq!(err.failure_class(), FailureClass::Transient);
        assert_eq!(sink.calls().len(), 3);
    }
}
