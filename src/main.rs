use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use artslot::config::Config;
use artslot::engine::Engine;
use artslot::notify::NotifyHub;
use artslot::store::MemoryStore;
use artslot::{http, observability, sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(MemoryStore::open(&config.wal_path())?);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store.clone(), notify, config.engine_config()));

    let background = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        background.clone(),
    ));
    let compactor_task = tokio::spawn(sweeper::run_compactor(
        store.clone(),
        config.compact_threshold,
        config.compact_interval,
        background.clone(),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("artslot listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  utc_offset: {}", config.utc_offset);
    info!("  hold_ttl: {:?} (max {:?})", config.hold_ttl, config.max_hold_ttl);
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    axum::serve(listener, http::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.cancel();
    let _ = tokio::join!(sweeper_task, compactor_task);
    if let Err(e) = store.compact().await {
        warn!("final compaction failed: {e}");
    }

    info!("artslot stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
