//! One replay pass over the dead letter queue. Safe to run next to a live consumer: replay
//! never touches the cursor.
use envconfig::Envconfig;
use firehose_consumer::app_context::AppContext;
use firehose_consumer::config::Config;
use firehose_consumer::setup_tracing;
use tracing::info;

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();

    let config = Config::init_from_env()?;
    info!(
        max_retries = config.dlq_max_retries,
        batch_size = config.replay_batch_size,
        "Starting dead letter replay"
    );

    let context = AppContext::new(config).await?;
    let summary = context.replayer().run_once().await?;

    info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Replay finished"
    );

    Ok(())
}
