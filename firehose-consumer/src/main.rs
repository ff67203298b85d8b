use std::sync::Arc;

use envconfig::Envconfig;
use firehose_consumer::app_context::AppContext;
use firehose_consumer::config::Config;
use firehose_consumer::lifecycle::{forward_shutdown, shutdown_signal, supervise};
use firehose_consumer::router::{router, serve, setup_metrics_routes};
use firehose_consumer::setup_tracing;
use firehose_consumer::transport::WebSocketTransport;
use tracing::info;

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting firehose consumer...");

    let config = Config::init_from_env()?;
    let bind = config.bind();

    info!(
        service = config.service_name,
        relay = config.relay_url,
        batch_size = config.cursor.batch_size,
        "Configuration loaded"
    );

    let transport = Arc::new(WebSocketTransport::new(
        &config.relay_url,
        config.frame_buffer_size,
    )?);

    let context = AppContext::new(config).await?;

    let app = setup_metrics_routes(router(context.admin_state()))?;
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(forward_shutdown(shutdown_signal(), shutdown_tx.clone()));

    let cursor = Arc::new(context.cursor_manager());
    let mut consumer = context.consumer(transport, cursor);
    let consumer_loop = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    supervise(consumer_loop, http_server, shutdown_tx).await?;

    info!("Firehose consumer shut down");
    Ok(())
}
