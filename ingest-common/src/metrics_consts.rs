pub const FRAMES_RECEIVED: &str = "firehose_frames_received";
pub const FRAMES_UNDECODABLE: &str = "firehose_frames_undecodable";
pub const FRAMES_STALE: &str = "firehose_frames_stale";
pub const OPERATIONS_TOTAL: &str = "firehose_operations_total";
pub const OPERATION_DURATION: &str = "firehose_operation_duration_ms";

pub const DLQ_WRITES: &str = "firehose_dlq_writes";
pub const DLQ_BACKLOG: &str = "firehose_dlq_backlog";
pub const DLQ_REPLAYED: &str = "firehose_dlq_replayed";

pub const CURSOR_FLUSHES: &str = "firehose_cursor_flushes";
pub const CURSOR_FLUSH_ERRORS: &str = "firehose_cursor_flush_errors";
pub const CURSOR_CACHE_ERRORS: &str = "firehose_cursor_cache_errors";
pub const CURSOR_SEQUENCE: &str = "firehose_cursor_sequence";

pub const RECONNECTS: &str = "firehose_reconnects";
pub const SINK_RETRIES: &str = "firehose_sink_retries";
pub const CACHE_INVALIDATION_ERRORS: &str = "firehose_cache_invalidation_errors";
pub const LEGACY_SHAPES: &str = "firehose_transform_legacy_shapes";
