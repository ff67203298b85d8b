use std::sync::Arc;
use std::time::Duration;

use ingest_common::cursor::{CursorError, CursorManager};
use ingest_common::dlq::{DeadLetterPayload, DeadLetterQueue};
use ingest_common::metrics_consts::{FRAMES_RECEIVED, FRAMES_STALE, FRAMES_UNDECODABLE, RECONNECTS};
use ingest_common::pipeline::{OperationProcessor, Outcome, ProcessingError};
use ingest_common::reconnect::ReconnectionManager;
use ingest_common::types::{CommitFrame, FrameEvent};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{ConsumerError, TransportError};
use crate::health::{ConsumerHealth, ConsumerState};
use crate::transport::{FirehoseTransport, Subscription};

/// Counters for one run of the consumer, returned when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub frames: u64,
    pub operations: u64,
    pub indexed: u64,
    pub deleted: u64,
    pub filtered: u64,
    pub dead_lettered: u64,
    /// Frames at or behind the cursor, redelivered after a reconnect.
    pub stale_frames: u64,
    pub disconnects: u64,
}

enum SessionEnd {
    Shutdown,
    Lost(TransportError),
}

/// Drives one logical stream: subscribe from the durable cursor, process every frame in order,
/// advance the cursor once a frame is fully handled, resubscribe with backoff when the
/// transport drops.
pub struct FirehoseConsumer {
    transport: Arc<dyn FirehoseTransport>,
    cursor: Arc<CursorManager>,
    processor: Arc<OperationProcessor>,
    dlq: DeadLetterQueue,
    reconnect: ReconnectionManager,
    connect_timeout: Duration,
    health: ConsumerHealth,
}

impl FirehoseConsumer {
    pub fn new(
        transport: Arc<dyn FirehoseTransport>,
        cursor: Arc<CursorManager>,
        processor: Arc<OperationProcessor>,
        dlq: DeadLetterQueue,
        reconnect: ReconnectionManager,
        connect_timeout: Duration,
        health: ConsumerHealth,
    ) -> Self {
        Self {
            transport,
            cursor,
            processor,
            dlq,
            reconnect,
            connect_timeout,
            health,
        }
    }

    /// Run until `shutdown` flips or a fatal `ConsumerError` occurs.
    /// The cursor manager is closed on every exit path.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerSummary, ConsumerError> {
        let result = self.run_until_stopped(&mut shutdown).await;
        let closed = self.cursor.close().await;
        self.health.set_state(ConsumerState::Stopped);

        match (result, closed) {
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    error!("final cursor flush failed: {}", close_error);
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(summary), Ok(())) => {
                info!(?summary, "firehose consumer stopped");
                Ok(summary)
            }
        }
    }

    async fn run_until_stopped(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConsumerSummary, ConsumerError> {
        let persisted = self.cursor.get_current_cursor().await?;
        if let Some(position) = &persisted {
            self.cursor.seed(position.sequence).await;
        }

        info!(
            service = self.cursor.service_name(),
            cursor = ?persisted.as_ref().map(|p| p.sequence),
            "starting firehose consumer"
        );

        let mut summary = ConsumerSummary::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.health.set_state(ConsumerState::Connecting);
            let resume = self.cursor.last_recorded().await;

            let subscribed = tokio::select! {
                result = tokio::time::timeout(self.connect_timeout, self.transport.subscribe(resume)) => {
                    result.unwrap_or(Err(TransportError::Timeout(self.connect_timeout)))
                }
                _ = shutdown.changed() => break,
            };

            let lost = match subscribed {
                Ok(mut subscription) => {
                    self.reconnect.reset();
                    self.health.connected();
                    info!(cursor = ?resume, "consuming firehose");

                    match self.consume(&mut subscription, shutdown, &mut summary).await? {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            summary.disconnects += 1;
            metrics::counter!(RECONNECTS).increment(1);
            self.reconnect.record_attempt();
            self.health
                .disconnected(self.reconnect.consecutive_failures(), &lost.to_string());

            if !self.reconnect.should_retry() {
                error!(
                    attempts = self.reconnect.consecutive_failures(),
                    "giving up on the relay: {}", lost
                );
                return Err(ConsumerError::ReconnectExhausted {
                    attempts: self.reconnect.consecutive_failures(),
                    last_error: lost,
                });
            }

            let delay = self.reconnect.next_backoff();
            warn!(
                attempt = self.reconnect.consecutive_failures(),
                max_attempts = self.reconnect.max_attempts(),
                "lost the relay ({}), reconnecting in {:?}",
                lost,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        Ok(summary)
    }

    async fn consume(
        &self,
        subscription: &mut Subscription,
        shutdown: &mut watch::Receiver<bool>,
        summary: &mut ConsumerSummary,
    ) -> Result<SessionEnd, ConsumerError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(frame)) => self.handle_frame(frame, summary).await?,
                Some(Err(e)) => return Ok(SessionEnd::Lost(e)),
                None => {
                    return Ok(SessionEnd::Lost(TransportError::Closed(
                        "subscription ended".to_owned(),
                    )))
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: FrameEvent,
        summary: &mut ConsumerSummary,
    ) -> Result<(), ConsumerError> {
        summary.frames += 1;
        metrics::counter!(FRAMES_RECEIVED).increment(1);
        self.health.record_frame(frame.seq());

        if let (Some(seq), Some(last)) = (frame.seq(), self.cursor.last_recorded().await) {
            if seq <= last {
                summary.stale_frames += 1;
                metrics::counter!(FRAMES_STALE).increment(1);
                return Ok(());
            }
        }

        match frame {
            FrameEvent::Commit(commit) => {
                self.handle_commit(&commit, summary).await?;
                self.advance(commit.seq).await
            }
            FrameEvent::Other { seq } => self.advance(seq).await,
            FrameEvent::Malformed {
                seq: Some(seq),
                raw,
                error,
            } => {
                metrics::counter!(FRAMES_UNDECODABLE).increment(1);
                warn!(seq, "undecodable frame: {}", error);
                self.dead_letter(
                    DeadLetterPayload::for_raw_frame(seq, &raw),
                    &ProcessingError::MalformedFrame(error),
                )
                .await?;
                summary.dead_lettered += 1;
                self.advance(seq).await
            }
            FrameEvent::Malformed {
                seq: None, error, ..
            } => {
                // Without a sequence there is nothing to resume from or replay against.
                metrics::counter!(FRAMES_UNDECODABLE).increment(1);
                warn!("skipping frame without a sequence number: {}", error);
                Ok(())
            }
        }
    }

    async fn handle_commit(
        &self,
        commit: &CommitFrame,
        summary: &mut ConsumerSummary,
    ) -> Result<(), ConsumerError> {
        for op in &commit.ops {
            summary.operations += 1;

            match self.processor.process(commit.seq, &commit.repo, op).await {
                Ok(Outcome::Indexed) => summary.indexed += 1,
                Ok(Outcome::Deleted) => summary.deleted += 1,
                Ok(Outcome::Filtered) => summary.filtered += 1,
                Err(e) => {
                    warn!(
                        seq = commit.seq,
                        path = %op.path,
                        error_type = %e.failure_class(),
                        "operation failed, dead lettering: {}",
                        e
                    );
                    self.dead_letter(
                        DeadLetterPayload::for_operation(commit.seq, &commit.repo, op),
                        &e,
                    )
                    .await?;
                    summary.dead_lettered += 1;
                }
            }
        }

        Ok(())
    }

    /// A failure to record a failure is fatal: carrying on would lose the event silently.
    async fn dead_letter(
        &self,
        payload: DeadLetterPayload,
        error: &ProcessingError,
    ) -> Result<(), ConsumerError> {
        self.dlq.add(payload, error, 0).await?;

        if let Err(e) = self.dlq.backlog().await {
            warn!("failed to refresh dead letter backlog: {}", e);
        }

        Ok(())
    }

    async fn advance(&self, seq: i64) -> Result<(), ConsumerError> {
        match self.cursor.update_cursor(seq).await {
            Ok(()) => Ok(()),
            Err(CursorError::Regression {
                current, attempted, ..
            }) => {
                // Stale frames are filtered before they get here.
                warn!(current, attempted, "ignoring cursor regression");
                Ok(())
            }
            Err(e) => {
                error!(seq, "failed to advance cursor: {}", e);
                Err(e.into())
            }
        }
    }
}
