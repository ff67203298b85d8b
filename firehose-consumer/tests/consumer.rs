use std::sync::Arc;
use std::time::Duration;

use firehose_consumer::consumer::{ConsumerSummary, FirehoseConsumer};
use firehose_consumer::error::ConsumerError;
use firehose_consumer::health::{ConsumerHealth, ConsumerState};
use firehose_consumer::testing::{commit, create, delete, ChannelTransport};
use ingest_common::cursor::{CursorManager, CursorSettings};
use ingest_common::dlq::{DeadLetterQueue, UNKNOWN_COLLECTION};
use ingest_common::filter::EventFilter;
use ingest_common::pipeline::{OperationProcessor, SinkRetry};
use ingest_common::reconnect::{BackoffPolicy, ReconnectionManager};
use ingest_common::replay::DlqReplayer;
use ingest_common::testing::{
    MemoryCursorCache, MemoryCursorStore, MemoryDeadLetterStore, RecordingSink, SinkCall,
};
use ingest_common::transform::RecordTransformer;
use ingest_common::types::{FrameEvent, WireOperation};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SERVICE: &str = "test-firehose";
const REPO: &str = "did:plc:alice";

struct Harness {
    transport: Arc<ChannelTransport>,
    cursor_store: Arc<MemoryCursorStore>,
    cursor_cache: Arc<MemoryCursorCache>,
    dlq_store: Arc<MemoryDeadLetterStore>,
    sink: Arc<RecordingSink>,
    health: ConsumerHealth,
    batch_size: usize,
    max_attempts: u32,
}

struct Running {
    cursor: Arc<CursorManager>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<ConsumerSummary, ConsumerError>>,
}

impl Running {
    async fn wait_for_cursor(&self, sequence: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.cursor.last_recorded().await != Some(sequence) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cursor never reached the expected sequence");
    }

    async fn stop(self) -> Result<ConsumerSummary, ConsumerError> {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap()
    }
}

impl Harness {
    fn new() -> Self {
        Self {
            transport: Arc::new(ChannelTransport::new()),
            cursor_store: Arc::new(MemoryCursorStore::new()),
            cursor_cache: Arc::new(MemoryCursorCache::new()),
            dlq_store: Arc::new(MemoryDeadLetterStore::new()),
            sink: Arc::new(RecordingSink::new()),
            health: ConsumerHealth::new(),
            batch_size: 10,
            max_attempts: 3,
        }
    }

    fn processor(&self) -> Arc<OperationProcessor> {
        Arc::new(OperationProcessor::new(
            EventFilter::with_allowlist("pub.example", ["pub.example.post", "pub.example.follow"]),
            RecordTransformer::new("pub.example"),
            self.sink.clone(),
            SinkRetry {
                max_retries: 2,
                interval: Duration::from_millis(1),
            },
        ))
    }

    fn dlq(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(self.dlq_store.clone())
    }

    fn start(&self) -> Running {
        let cursor = Arc::new(CursorManager::new(
            SERVICE,
            self.cursor_store.clone(),
            self.cursor_cache.clone(),
            CursorSettings {
                batch_size: self.batch_size,
                flush_interval: Duration::ZERO,
                cache_ttl: Duration::from_secs(60),
            },
        ));

        let policy = BackoffPolicy::build(2, Duration::from_millis(10))
            .maximum_interval(Duration::from_millis(100))
            .jitter(false)
            .provide();

        let mut consumer = FirehoseConsumer::new(
            self.transport.clone(),
            cursor.clone(),
            self.processor(),
            self.dlq(),
            ReconnectionManager::new(self.max_attempts, policy),
            Duration::from_secs(1),
            self.health.clone(),
        );

        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(receiver).await });

        Running {
            cursor,
            shutdown,
            handle,
        }
    }

    fn applied(&self) -> usize {
        self.sink
            .calls()
            .iter()
            .filter(|call| matches!(call, SinkCall::Apply(_)))
            .count()
    }
}

fn post(rkey: i64) -> WireOperation {
    create(
        &format!("pub.example.post/{rkey}"),
        json!({"text": format!("post {rkey}"), "createdAt": "2024-05-01T12:00:00Z"}),
    )
}

fn broken_post(rkey: i64) -> WireOperation {
    create(
        &format!("pub.example.post/{rkey}"),
        json!({"text": "no timestamp"}),
    )
}

fn follow(rkey: i64) -> WireOperation {
    create(
        &format!("pub.example.follow/{rkey}"),
        json!({"subject": "did:plc:bob", "createdAt": "2024-05-01T12:00:00Z"}),
    )
}

#[tokio::test]
async fn test_end_to_end_hundred_operations() {
    let harness = Harness::new();

    let mut originals = Vec::new();
    let frames: Vec<FrameEvent> = (1..=100)
        .map(|seq| {
            let op = match seq {
                50 => create(
                    "pub.example.like/50",
                    json!({"subject": "at://x", "createdAt": "2024-05-01T12:00:00Z"}),
                ),
                10 | 20 | 30 | 40 => {
                    let op = broken_post(seq);
                    originals.push(op.clone());
                    op
                }
                _ if seq % 2 == 0 => post(seq),
                _ => follow(seq),
            };
            commit(seq, REPO, vec![op])
        })
        .collect();

    harness.transport.push_open_session(frames);

    let running = harness.start();
    running.wait_for_cursor(100).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.frames, 100);
    assert_eq!(summary.operations, 100);
    assert_eq!(summary.indexed, 95);
    assert_eq!(summary.dead_lettered, 4);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.stale_frames, 0);
    assert_eq!(harness.applied(), 95);

    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(100));
    assert_eq!(
        harness.cursor_cache.get("cursor:test-firehose"),
        Some((100, Duration::from_secs(60)))
    );

    let entries = harness.dlq_store.entries();
    assert_eq!(entries.len(), 4);
    for (entry, original) in entries.iter().zip(&originals) {
        assert_eq!(entry.collection, "pub.example.post");
        assert_eq!(entry.error_type, "permanent");
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.decode_payload().unwrap().operation.as_ref(), Some(original));
    }
    assert_eq!(
        entries.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![10, 20, 30, 40]
    );

    assert_eq!(harness.health.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_deletes_are_applied() {
    let harness = Harness::new();
    harness.transport.push_open_session(vec![
        commit(1, REPO, vec![post(1)]),
        commit(2, REPO, vec![delete("pub.example.post/1")]),
    ]);

    let running = harness.start();
    running.wait_for_cursor(2).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(harness.applied(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let harness = Harness::new();
    for _ in 0..5 {
        harness.transport.push_failure("connection refused");
    }

    let running = harness.start();
    let result = running.handle.await.unwrap();

    match result {
        Err(ConsumerError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected reconnect exhaustion, got {other:?}"),
    }
    assert_eq!(harness.transport.subscribed_from(), vec![None, None, None]);
    assert_eq!(harness.health.state(), ConsumerState::Stopped);
    assert_eq!(harness.health.snapshot().consecutive_failures, 3);
}

#[tokio::test]
async fn test_resubscribes_from_last_handled_sequence() {
    let harness = Harness::new();
    harness.transport.push_session(vec![
        commit(1, REPO, vec![post(1)]),
        commit(2, REPO, vec![post(2)]),
        commit(3, REPO, vec![post(3)]),
    ]);
    harness.transport.push_failure("relay restarting");
    // The relay redelivers 3 after the reconnect.
    harness.transport.push_open_session(vec![
        commit(3, REPO, vec![post(3)]),
        commit(4, REPO, vec![post(4)]),
    ]);

    let running = harness.start();
    running.wait_for_cursor(4).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(
        harness.transport.subscribed_from(),
        vec![None, Some(3), Some(3)]
    );
    assert_eq!(summary.disconnects, 2);
    assert_eq!(summary.stale_frames, 1);
    assert_eq!(summary.indexed, 4);
    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(4));
}

#[tokio::test]
async fn test_resumes_from_persisted_cursor() {
    let harness = Harness::new();
    harness.cursor_store.set(SERVICE, 41);
    harness.transport.push_open_session(vec![
        commit(40, REPO, vec![post(40)]),
        commit(41, REPO, vec![post(41)]),
        commit(42, REPO, vec![post(42)]),
    ]);

    let running = harness.start();
    running.wait_for_cursor(42).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(harness.transport.subscribed_from(), vec![Some(41)]);
    assert_eq!(summary.stale_frames, 2);
    assert_eq!(summary.indexed, 1);
    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(42));
}

#[tokio::test]
async fn test_dead_letter_outage_stops_consumer() {
    let harness = Harness::new();
    harness.dlq_store.fail(true);
    harness.transport.push_open_session(vec![
        commit(1, REPO, vec![post(1)]),
        commit(2, REPO, vec![broken_post(2)]),
        commit(3, REPO, vec![post(3)]),
    ]);

    let running = harness.start();
    let result = running.handle.await.unwrap();

    assert!(matches!(result, Err(ConsumerError::DeadLetter(_))));
    // Sequence 2 was never handled, so it must be redelivered on restart.
    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(1));
    assert_eq!(harness.applied(), 1);
    assert_eq!(harness.health.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_cursor_store_outage_stops_consumer() {
    let harness = Harness::new();
    harness.cursor_store.fail(true);

    let running = harness.start();
    let result = running.handle.await.unwrap();

    assert!(matches!(result, Err(ConsumerError::Cursor(_))));
    assert!(harness.transport.subscribed_from().is_empty());
}

#[tokio::test]
async fn test_undecodable_frames() {
    let harness = Harness::new();
    harness.transport.push_open_session(vec![
        FrameEvent::decode("not json at all"),
        FrameEvent::decode(r#"{"seq": 7, "repo": "did:plc:alice", "ops": 5}"#),
        FrameEvent::decode(r#"{"seq": 8, "did": "did:plc:alice", "handle": "alice.example"}"#),
    ]);

    let running = harness.start();
    running.wait_for_cursor(8).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.operations, 0);

    let entries = harness.dlq_store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].seq, 7);
    assert_eq!(entries[0].collection, UNKNOWN_COLLECTION);
    assert_eq!(entries[0].error_type, "permanent");
    let payload = entries[0].decode_payload().unwrap();
    assert!(payload.operation.is_none());
    assert!(payload.raw_frame.unwrap().contains("\"ops\": 5"));

    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(8));
}

#[tokio::test]
async fn test_shutdown_flushes_pending_cursor() {
    let mut harness = Harness::new();
    harness.batch_size = 1000;
    harness
        .transport
        .push_open_session((1..=5).map(|seq| commit(seq, REPO, vec![post(seq)])).collect());

    let running = harness.start();
    running.wait_for_cursor(5).await;
    assert_eq!(harness.cursor_store.writes(), 0);

    running.stop().await.unwrap();

    assert_eq!(harness.cursor_store.writes(), 1);
    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(5));
}

#[tokio::test(start_paused = true)]
async fn test_hung_handshake_times_out() {
    let harness = Harness::new();
    harness.transport.push_hang();
    harness
        .transport
        .push_open_session(vec![commit(1, REPO, vec![post(1)])]);

    let running = harness.start();
    running.wait_for_cursor(1).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(harness.transport.subscribed_from(), vec![None, None]);
    assert_eq!(summary.disconnects, 1);
    assert_eq!(summary.indexed, 1);
}

#[tokio::test]
async fn test_sink_outage_is_transient_and_replayable() {
    let harness = Harness::new();
    harness.sink.fail_always(true);
    harness
        .transport
        .push_open_session(vec![commit(1, REPO, vec![post(1)])]);

    let running = harness.start();
    running.wait_for_cursor(1).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    // One attempt plus two inline retries.
    assert_eq!(harness.applied(), 3);

    let entries = harness.dlq_store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error_type, "transient");

    harness.sink.fail_always(false);
    let replay = DlqReplayer::new(harness.dlq(), harness.processor(), 5, 10)
        .run_once()
        .await
        .unwrap();

    assert_eq!(replay.succeeded, 1);
    assert!(harness.dlq_store.entries().is_empty());
    assert_eq!(harness.cursor_store.sequence(SERVICE), Some(1));
    assert_eq!(harness.cursor_store.writes(), 1);
}

#[tokio::test]
async fn test_health_tracks_subscription() {
    let harness = Harness::new();
    harness
        .transport
        .push_open_session(vec![commit(9, REPO, vec![post(9)])]);

    let running = harness.start();
    running.wait_for_cursor(9).await;

    assert_eq!(harness.health.state(), ConsumerState::Subscribed);
    assert!(harness.health.readiness().healthy);
    assert_eq!(harness.health.snapshot().last_sequence, Some(9));

    running.stop().await.unwrap();

    assert!(!harness.health.liveness().healthy);
}
