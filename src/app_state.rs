// =============================================================================
// Application State — the explicit dependency graph, assembled once
// =============================================================================
//
// No global singletons: every subsystem is constructed here, wired to its
// collaborators, and shared through `Arc<AppState>`. The only process-wide
// state is the configuration snapshot and the tracing subscriber.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use crate::breaker::CircuitBreakerRegistry;
use crate::bus::MessageBus;
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::exchange::client::HyperliquidClient;
use crate::ledger::OrderLedger;
use crate::orchestrator::stages::StagePlugins;
use crate::orchestrator::TradingOrchestrator;
use crate::persistence::{JsonlTraceStore, TraceStore};
use crate::recovery::{ActiveStrategies, PositionRecoveryMonitor};

pub struct AppState {
    pub config: EngineConfig,
    pub bus: Arc<MessageBus>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub ledger: Arc<OrderLedger>,
    pub client: Arc<HyperliquidClient>,
    pub engine: Arc<ExecutionEngine>,
    pub recovery: Arc<PositionRecoveryMonitor>,
    pub orchestrator: Arc<TradingOrchestrator>,
    pub strategies: Arc<ActiveStrategies>,
    pub start_time: Instant,
}

impl AppState {
    /// Assemble the full graph from a configuration snapshot.
    pub fn build(config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let bus = Arc::new(MessageBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breaker.clone(),
            bus.clone(),
        ));
        let ledger = Arc::new(OrderLedger::new(bus.clone()));
        let client = Arc::new(HyperliquidClient::new(&config, ledger.clone(), bus.clone()));

        let store: Arc<dyn TraceStore> = Arc::new(
            JsonlTraceStore::new(&config.data_dir)
                .with_context(|| format!("creating data directory '{}'", config.data_dir))?,
        );

        let engine = Arc::new(ExecutionEngine::new(
            client.clone(),
            bus.clone(),
            store.clone(),
            &config,
        ));
        let strategies = Arc::new(ActiveStrategies::new());
        let recovery = Arc::new(PositionRecoveryMonitor::new(
            engine.clone(),
            bus.clone(),
            breakers.clone(),
            strategies.clone(),
            config.recovery.clone(),
        ));
        let orchestrator = Arc::new(TradingOrchestrator::new(
            client.clone(),
            engine.clone(),
            breakers.clone(),
            bus.clone(),
            store,
            strategies.clone(),
            StagePlugins::default(),
            &config,
        ));

        Ok(Arc::new(Self {
            config,
            bus,
            breakers,
            ledger,
            client,
            engine,
            recovery,
            orchestrator,
            strategies,
            start_time: Instant::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_builds_from_default_config() {
        let config = EngineConfig {
            data_dir: std::env::temp_dir()
                .join(format!("meridian-appstate-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            ..EngineConfig::default()
        };
        let data_dir = config.data_dir.clone();
        let state = AppState::build(config).unwrap();

        assert!(!state.bus.is_connected());
        assert_eq!(state.config.symbols.len(), 3);
        assert!(!state.engine.is_emergency_stopped());

        std::fs::remove_dir_all(data_dir).ok();
    }
}
