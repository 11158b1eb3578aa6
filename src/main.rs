// ─────────────────────────────────────────────────────────────────────────────
// copy-engine-rs: multi-pair Hyperliquid copy-trading daemon.
//
// Mirrors perpetual positions from leader accounts onto independently
// configured follower accounts: streaming fills drive proportional orders,
// a periodic reconciler corrects drift, and pre-existing leader positions
// are excluded from mirroring.
// ─────────────────────────────────────────────────────────────────────────────
mod config;
mod engine;
mod exchange;
mod history;
mod logger;
mod metadata;
mod numeric;
mod orchestrator;
mod persistence;
mod reconciler;
mod signal;
mod signing;
mod state;
mod stream;
mod trade_log;

use std::path::PathBuf;

use config::Config;
use orchestrator::Orchestrator;

fn config_path() -> PathBuf {
    std::env::var("COPY_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_else(|| "config.json".to_string())
        .into()
}

#[tokio::main]
async fn main() {
    // .env is optional; missing files are silently ignored.
    dotenvy::dotenv().ok();

    let path = config_path();
    let cfg = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level when set.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.log_level.clone()),
    )
    .init();

    log::info!("copy-engine-rs starting ({:?})", cfg.environment);
    log::info!(
        "  config: {:?} | pairs: {} enabled / {} total | state dir: {}",
        path,
        cfg.enabled_pairs().count(),
        cfg.pairs.len(),
        cfg.state_dir
    );

    let orchestrator = match Orchestrator::new(cfg) {
        Ok(o) => o,
        Err(e) => {
            log::error!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator.start().await {
        log::error!("fatal startup error: {}", e);
        std::process::exit(1);
    }
    for status in orchestrator.status() {
        log::info!(
            "  pair {}: {} ({} -> {})",
            status.pair_id,
            status.state,
            status.leader_address,
            status.follower_address
        );
    }

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received; stopping…");

    // A second signal skips the graceful path.
    tokio::spawn(async {
        wait_for_shutdown_signal().await;
        log::warn!("second signal; exiting immediately");
        std::process::exit(130);
    });

    orchestrator.stop().await;
    for status in orchestrator.status() {
        log::info!("  pair {}: {}", status.pair_id, status.state);
    }
    log::info!("clean shutdown");
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
