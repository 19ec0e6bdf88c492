use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use vizgate::cache::BackendCache;
use vizgate::config::Config;
use vizgate::gateway::Gateway;
use vizgate::launcher::ProcessLauncher;
use vizgate::reaper::IdleReaper;
use vizgate::source::{FileSource, ItemSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vizgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "failed to read configuration");
        e
    })?;
    config.validate()?;

    info!(
        backend = %config.backend_location,
        data_root = %config.data_root,
        port = config.gateway_port,
        external = %config.external_base(),
        ttl_secs = config.ttl_secs,
        annotations = config.enable_annotations,
        backed = config.enable_backed_mode,
        "starting vizgate"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = ProcessLauncher::from_config(&config);
    let cache = BackendCache::new(launcher);
    let sources: Vec<Arc<dyn ItemSource>> =
        vec![Arc::new(FileSource::new("local", config.data_root.clone()))];

    let reaper = IdleReaper::new(Arc::clone(&cache), config.ttl());
    let reaper_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        reaper.run(reaper_shutdown_rx).await;
    });

    let gateway = Gateway::new(config, Arc::clone(&cache), sources);
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run(shutdown_rx).await {
            error!(error = %e, "gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    cache.terminate_all();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), gateway_handle).await;

    info!("Shutdown complete");
    Ok(())
}
