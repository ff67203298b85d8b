use ingest_common::cursor::CursorError;
use ingest_common::dlq::DeadLetterError;
use thiserror::Error;

/// Errors talking to the upstream relay. All of them are retried through the reconnection
/// manager.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid relay url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out after {0:?} waiting for the relay")]
    Timeout(std::time::Duration),
    #[error("subscription closed: {0}")]
    Closed(String),
}

/// Conditions that stop the consumer as a whole. Per-operation failures never end up here.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("cursor store failed: {0}")]
    Cursor(#[from] CursorError),
    #[error("dead letter queue unavailable, refusing to drop events: {0}")]
    DeadLetter(#[from] DeadLetterError),
    #[error("gave up reconnecting after {attempts} consecutive failures, last error: {last_error}")]
    ReconnectExhausted {
        attempts: u32,
        last_error: TransportError,
    },
}

/// Failures while wiring the service together. The consumer does not start partially.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to connect to postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to connect to redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
