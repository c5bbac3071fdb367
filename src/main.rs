// =============================================================================
// Meridian Perps Engine — Main Entry Point
// =============================================================================
//
// Startup wires the dependency graph, pre-warms venue metadata, and spawns
// the background workers:
//   - one cycle worker per (symbol, timeframe)
//   - the managed-exit monitor
//   - the position-recovery monitor
//   - the stale-order watchdog
//   - the operator HTTP API
// Shutdown (SIGINT/SIGTERM) flips a watch channel every worker selects on,
// then disconnects the bus. Resting venue orders are left alone — cancelling
// them is an operator decision.
// =============================================================================

mod api;
mod app_state;
mod breaker;
mod bus;
mod cache;
mod config;
mod engine;
mod error;
mod exchange;
mod ledger;
mod market;
mod orchestrator;
mod persistence;
mod recovery;
mod retry;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bus::Channel;
use crate::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Perps Engine starting up");

    // A config error here is fatal: exit code 1 through anyhow.
    let config = EngineConfig::from_env().context("startup configuration")?;
    let dashboard_port = config.dashboard_port;
    let cycle_interval = Duration::from_secs(config.cycle_interval_secs);

    // ── 2. Dependency graph ──────────────────────────────────────────────
    let state = AppState::build(config).context("assembling subsystems")?;
    state.bus.connect();

    // Mirror significant bus traffic into the operator log.
    for channel in [
        Channel::ExecutionFilled,
        Channel::ExecutionFailed,
        Channel::PositionOpened,
        Channel::PositionClosed,
        Channel::CircuitBreakerOpen,
        Channel::CircuitBreakerClosed,
        Channel::CycleError,
        Channel::Error,
    ] {
        state.bus.subscribe(
            channel,
            "event-log",
            Arc::new(|msg| {
                info!(channel = %msg.channel, data = %msg.data, "bus event");
            }),
        );
    }

    // ── 3. Venue metadata pre-warm ───────────────────────────────────────
    if let Err(e) = state.client.initialize().await {
        // Not fatal: the client re-fetches on first use.
        warn!(error = %e, "venue metadata pre-warm failed — will retry on demand");
    }

    // ── 4. Shutdown signal shared by every worker ────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 5. Operator API ──────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = format!("0.0.0.0:{dashboard_port}");
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "operator API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "operator API failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "operator API could not bind"),
        }
    });

    // ── 6. Cycle workers, one per (symbol, timeframe) ────────────────────
    for symbol in &state.config.symbols {
        for timeframe in &state.config.timeframes {
            tokio::spawn(orchestrator::run_cycle_worker(
                state.orchestrator.clone(),
                symbol.clone(),
                timeframe.clone(),
                cycle_interval,
                shutdown_rx.clone(),
            ));
        }
    }
    info!(
        workers = state.config.symbols.len() * state.config.timeframes.len(),
        "cycle workers launched"
    );

    // ── 7. Managed-exit monitor ──────────────────────────────────────────
    tokio::spawn(engine::exits::run_managed_exit_monitor(
        state.engine.clone(),
        shutdown_rx.clone(),
    ));

    // ── 8. Position-recovery monitor ─────────────────────────────────────
    tokio::spawn(recovery::run_recovery_monitor(
        state.recovery.clone(),
        shutdown_rx.clone(),
    ));

    // ── 9. Stale-order watchdog ──────────────────────────────────────────
    tokio::spawn(exchange::watchdog::run_stale_order_watchdog(
        state.client.clone(),
        shutdown_rx.clone(),
    ));

    info!("all subsystems running");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    wait_for_shutdown_signal().await;
    warn!("shutdown signal received — stopping workers");

    let _ = shutdown_tx.send(true);
    // Give workers a tick to observe the signal.
    tokio::time::sleep(Duration::from_millis(250)).await;
    state.bus.disconnect();

    info!("Meridian Perps Engine shut down complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
