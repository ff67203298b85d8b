//! # Replay
//!
//! Re-runs dead lettered operations through the same pipeline as the live consumer. Successful
//! entries are deleted; failing ones have their retry count bumped and are left for the next
//! pass, or for an operator once they run out of retries. The cursor is never touched.
use std::sync::Arc;

use tracing::{info, warn};

use crate::dlq::{DeadLetterEntry, DeadLetterError, DeadLetterQueue, ListOptions, ListOrder};
use crate::metrics_consts::DLQ_REPLAYED;
use crate::pipeline::{OperationProcessor, ProcessingError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct DlqReplayer {
    dlq: DeadLetterQueue,
    processor: Arc<OperationProcessor>,
    max_retries: i32,
    batch_size: i64,
}

impl DlqReplayer {
    pub fn new(
        dlq: DeadLetterQueue,
        processor: Arc<OperationProcessor>,
        max_retries: i32,
        batch_size: i64,
    ) -> Self {
        Self {
            dlq,
            processor,
            max_retries,
            batch_size: batch_size.max(1),
        }
    }

    /// One pass over every entry still under the retry bound, oldest first.
    pub async fn run_once(&self) -> Result<ReplaySummary, DeadLetterError> {
        let mut summary = ReplaySummary::default();
        // Succeeded entries are deleted and entries reaching the retry bound drop out of the
        // listing, so only failures still under the bound push the next page along.
        let mut offset = 0;

        loop {
            let page = self
                .dlq
                .list(&ListOptions {
                    limit: self.batch_size,
                    offset,
                    collection: None,
                    max_retry_count: Some(self.max_retries),
                    order: ListOrder::OldestFirst,
                })
                .await?;

            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            for entry in page {
                summary.attempted += 1;
                match self.replay(&entry).await {
                    Ok(()) => {
                        self.dlq.delete(entry.id).await?;
                        summary.succeeded += 1;
                        metrics::counter!(DLQ_REPLAYED, "result" => "succeeded").increment(1);
                    }
                    Err(e) => {
                        warn!(id = %entry.id, seq = entry.seq, "replay failed: {}", e);
                        self.dlq.record_retry(entry.id, &e).await?;
                        summary.failed += 1;
                        if entry.retry_count + 1 < self.max_retries {
                            offset += 1;
                        }
                        metrics::counter!(DLQ_REPLAYED, "result" => "failed").increment(1);
                    }
                }
            }

            if (page_len as i64) < self.batch_size {
                break;
            }
        }

        self.dlq.backlog().await?;

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "dead letter replay finished"
        );

        Ok(summary)
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> Result<(), ProcessingError> {
        let payload = entry
            .decode_payload()
            .map_err(|e| ProcessingError::MalformedFrame(e.to_string()))?;

        let Some(operation) = payload.operation else {
            return Err(ProcessingError::MalformedFrame(
                "entry holds an undecodable frame".to_owned(),
            ));
        };

        self.processor
            .process(payload.seq, &payload.repo, &operation)
            .await
            .map(|_| ())
    }
}
