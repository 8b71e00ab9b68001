use anyhow::{Context, Result};
use chorus_backend::config::FleetConfig;
use chorus_backend::fleet::handle::FleetHandle;
use chorus_backend::runtime::BackendRuntime;
use chorus_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chorus_backend=debug")),
        )
        .init();

    let config = FleetConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting headless fleet service (set CHORUS_BACKEND_TOKEN + optional CHORUS_BACKEND_BIND; auth mode via CHORUS_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let shutdown = runtime.fleet.shutdown_token();
        let (handle, requests) = FleetHandle::channel();
        let fleet_task = tokio::spawn(async move { runtime.run(requests).await });

        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Interrupt received, shutting down");
                    signal.cancel();
                }
                Err(e) => tracing::warn!("Cannot listen for ctrl-c: {}", e),
            }
        });

        let result = serve_backend(handle, event_rx, shutdown.clone()).await;
        // A failed server takes the fleet down with it.
        shutdown.cancel();

        if let Err(e) = fleet_task.await {
            tracing::error!("Fleet task failed: {}", e);
        }
        result
    })
}
