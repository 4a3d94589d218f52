use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use pitstop::arbiter::InMemoryArbiter;
use pitstop::coordinator::BookingCoordinator;
use pitstop::directory::StaticDirectory;
use pitstop::http::{app, AppState};
use pitstop::reaper;
use pitstop::store::SlotStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PITSTOP_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    pitstop::observability::init(metrics_port);

    let port = std::env::var("PITSTOP_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("PITSTOP_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("PITSTOP_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let garages_path =
        std::env::var("PITSTOP_GARAGES").unwrap_or_else(|_| "./garages.json".into());
    let hold_ttl_secs: u64 = std::env::var("PITSTOP_HOLD_TTL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let attempt_timeout_secs: u64 = std::env::var("PITSTOP_ATTEMPT_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let compact_threshold: u64 = std::env::var("PITSTOP_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let garages = std::fs::read_to_string(&garages_path)?;
    let directory = Arc::new(StaticDirectory::from_json(&garages)?);

    let store = Arc::new(SlotStore::open(
        PathBuf::from(&data_dir).join("pitstop.wal"),
        directory.clone(),
    )?);
    let arbiter = Arc::new(InMemoryArbiter::new(Duration::from_secs(hold_ttl_secs)));
    let coordinator = Arc::new(BookingCoordinator::new(
        store.clone(),
        arbiter.clone(),
        Duration::from_secs(attempt_timeout_secs),
    ));

    tokio::spawn(reaper::run_hold_reaper(arbiter.clone()));
    tokio::spawn(reaper::run_compactor(store.clone(), compact_threshold));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("pitstop listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  garages: {} loaded from {garages_path}", directory.garage_count());
    info!("  hold_ttl: {hold_ttl_secs}s, attempt_timeout: {attempt_timeout_secs}s");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let state = AppState { store, coordinator };
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("pitstop stopped");
    Ok(())
}

/// Resolve on SIGTERM/ctrl-c; axum stops accepting and drains in-flight
/// requests.
async fn shutdown_signal() {
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
    info!("shutdown signal received");
}
