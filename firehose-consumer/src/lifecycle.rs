//! Process shutdown: OS signals in, one watch flag out, and the consumer always gets to close
//! its cursor before the process exits.
use std::future::Future;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::consumer::ConsumerSummary;
use crate::error::ConsumerError;

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    Ok(())
}

/// Flip `shutdown` once `signal` resolves. If the handlers cannot be installed the sender is
/// held forever, since dropping it would read as a shutdown request.
pub async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("failed to install shutdown signal handlers: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown signal received");
    if shutdown.send(true).is_err() {
        info!("consumer already stopped");
    }
}

/// Wait for whichever of the consumer and the HTTP server stops first. When the server goes
/// down the consumer is told to stop and awaited, so its final cursor flush still happens.
pub async fn supervise(
    mut consumer: JoinHandle<Result<ConsumerSummary, ConsumerError>>,
    mut http_server: JoinHandle<io::Result<()>>,
    shutdown: watch::Sender<bool>,
) -> Result<ConsumerSummary, anyhow::Error> {
    tokio::select! {
        res = &mut consumer => {
            http_server.abort();
            match res? {
                Ok(summary) => {
                    info!(?summary, "consumer finished");
                    Ok(summary)
                }
                Err(e) => {
                    error!("consumer failed: {}", e);
                    Err(e.into())
                }
            }
        }
        res = &mut http_server => {
            error!("http server exited, stopping consumer");
            if shutdown.send(true).is_err() {
                info!("consumer already stopped");
            }

            let consumer_result = consumer.await?;
            res??;
            // The server only ever returns on error, but a clean exit still stops the service.
            Ok(consumer_result?)
        }
    }
}
