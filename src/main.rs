// =============================================================================
// bin-sentinel — Main Entry Point
// =============================================================================
//
// Startup order mirrors the data-flow dependency chain: build static config,
// build the shared engine state, reconcile on-chain truth once before the
// crons start (so a restart never trades against stale position state), spawn
// the scheduler's cron loops, then the HTTP boundary. Shutdown reverses it:
// stop taking new work, let in-flight cron ticks drain, persist, exit.
// =============================================================================

mod api;
mod app_state;
mod boundary;
mod config;
mod error;
mod indicators;
mod market_data;
mod pool;
mod position;
mod rpc;
mod scheduler;
mod types;
mod wallet;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{LiveConfig, StaticConfig};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                bin-sentinel — starting up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let static_config = match StaticConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load static configuration — aborting startup");
            return std::process::ExitCode::from(1);
        }
    };
    info!(%static_config, "static configuration loaded");

    if static_config.pools.is_empty() {
        error!("no timeframe has a configured pool — nothing to trade, aborting startup");
        return std::process::ExitCode::from(1);
    }

    let data_dir = std::path::PathBuf::from(&static_config.data_dir);
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        error!(%err, dir = %data_dir.display(), "failed to create data directory — aborting startup");
        return std::process::ExitCode::from(1);
    }

    let live_config_path = data_dir.join("live_config.json");
    let live_config = LiveConfig::load(&live_config_path).unwrap_or_else(|err| {
        warn!(%err, "no usable live config on disk — starting from defaults");
        LiveConfig::default()
    });

    let state = Arc::new(AppState::new(static_config, live_config));

    if let Err(err) = state.load_persisted_state() {
        error!(%err, "failed to load persisted position/balance state — aborting startup");
        return std::process::ExitCode::from(1);
    }

    // Reconcile on-chain truth once before any cron fires — a position whose
    // close was mid-flight at the previous shutdown is picked up here, not
    // left to drift until the periodic resync.
    state.scheduler.startup_reconcile().await;

    let scheduler_handles = state.scheduler.clone().spawn();
    info!(count = scheduler_handles.len(), "scheduler cron loops launched");

    let bind_addr = std::env::var("BIN_SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        let app = api::rest::router(server_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%err, %bind_addr, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "API server exited with an error");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler — shutting down anyway");
    }
    warn!("shutdown signal received — draining in-flight work");

    // The shutdown flag only takes effect at the next tick boundary, and the
    // longest cron period (D1) can be a full day away — abort rather than
    // wait for loops to notice.
    state.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
    server_handle.abort();
    for handle in &scheduler_handles {
        handle.abort();
    }
    for handle in scheduler_handles {
        let _ = handle.await;
    }

    if let Err(err) = state.persist_all() {
        error!(%err, "failed to persist state on shutdown");
        return std::process::ExitCode::from(1);
    }

    info!("bin-sentinel shut down complete");
    std::process::ExitCode::SUCCESS
}
