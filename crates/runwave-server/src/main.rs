//! RunWave server entry point.
//!
//! Syncs the sandbox pod pool, then serves HTTP until Ctrl-C. A pool that
//! cannot be synced at startup is fatal.

use anyhow::Context;
use runwave_server::{http, RunwaveServer, ServerConfig};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("runwave_server=info".parse()?)
                .add_directive("runwave_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting RunWave server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so a kubectl on PATH or an in-cluster config still works.
    config.validate_warn();

    let server = RunwaveServer::new(&config).context("invalid configuration")?;

    server
        .start_sync()
        .await
        .context("failed to sync sandbox pod pool")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_server = server.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        http::serve(http_server, http_addr, shutdown).await
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    let stopped_early = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
            let _ = shutdown_tx.send(());
            None
        }
        result = &mut http_handle => {
            tracing::error!("HTTP server stopped unexpectedly, cleaning up...");
            Some(result)
        }
    };
    let served = match stopped_early {
        Some(result) => result,
        None => http_handle.await,
    };

    server.shutdown_sync().await;

    served
        .context("HTTP server task panicked")?
        .with_context(|| format!("HTTP server on {http_addr} failed"))?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
