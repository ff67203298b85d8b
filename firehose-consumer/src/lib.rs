use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub mod app_context;
pub mod config;
pub mod consumer;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod router;
pub mod testing;
pub mod transport;

/// Log to stdout at INFO unless `RUST_LOG` says otherwise.
pub fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}
