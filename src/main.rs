use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use trimslot::engine::Engine;
use trimslot::lock::TtlLockMap;
use trimslot::notify::PushHub;
use trimslot::{http, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("TRIMSLOT_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    trimslot::observability::init(metrics_port);

    let port = std::env::var("TRIMSLOT_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("TRIMSLOT_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("TRIMSLOT_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let lock_ttl_secs: u64 = std::env::var("TRIMSLOT_LOCK_TTL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let compact_threshold: u64 = std::env::var("TRIMSLOT_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("bookings.wal");

    let locks = Arc::new(TtlLockMap::new(Duration::from_secs(lock_ttl_secs)));
    let hub = Arc::new(PushHub::new());
    let engine = Arc::new(Engine::new(wal_path, locks.clone(), hub)?);

    tokio::spawn(reaper::run_lock_reaper(locks));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("trimslot listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  lock_ttl: {lock_ttl_secs}s");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };

    axum::serve(listener, http::router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("trimslot stopped");
    Ok(())
}
