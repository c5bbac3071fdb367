// =============================================================================
// Trading Orchestrator — the staged cycle pipeline
// =============================================================================
//
//   INIT -> MARKET_DATA -> PATTERN_RECALL -> STRATEGY_IDEATION
//        -> BACKTESTER -> STRATEGY_SELECTOR -> RISK_GATE
//        -> [EXECUTION -> LEARNING]? -> DONE
//
// Every stage runs through its named circuit breaker. Non-critical stages
// fall back to a degraded patch and the cycle keeps going; the two CRITICAL
// stages (risk-gate, executor) abort the cycle on failure. A cycle with any
// stage failure counts against the consecutive-error budget; hitting the
// budget forces the `execution` breaker open and subsequent cycles return
// SKIPPED_CIRCUIT_BREAKER without running a single stage. One successful
// execution resets the budget.
// =============================================================================

pub mod stages;
pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{CircuitBreakerRegistry, HealthSummary, EXECUTION_BREAKER};
use crate::bus::{Channel, MessageBus};
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::error::EngineError;
use crate::exchange::client::HyperliquidClient;
use crate::market::IndicatorSet;
use crate::persistence::TraceStore;
use crate::recovery::ActiveStrategies;
use crate::types::{OrderType, Signal};

use self::stages::{PatternOutcome, StagePlugins};
use self::state::{CycleState, CycleStep, ExecutionRecord, ExecutionStatus, StagePatch};

/// Candle window requested per cycle; gating needs at least 50 closed bars.
const CANDLE_WINDOW: u32 = 120;
const MIN_CANDLES: usize = 50;

pub struct TradingOrchestrator {
    client: Arc<HyperliquidClient>,
    engine: Arc<ExecutionEngine>,
    breakers: Arc<CircuitBreakerRegistry>,
    bus: Arc<MessageBus>,
    store: Arc<dyn TraceStore>,
    strategies: Arc<ActiveStrategies>,
    plugins: StagePlugins,

    trading_enabled: bool,
    max_consecutive_errors: u32,
    consecutive_errors: AtomicU32,
    cycles_run: AtomicU64,
    cycles_failed: AtomicU64,
}

impl TradingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<HyperliquidClient>,
        engine: Arc<ExecutionEngine>,
        breakers: Arc<CircuitBreakerRegistry>,
        bus: Arc<MessageBus>,
        store: Arc<dyn TraceStore>,
        strategies: Arc<ActiveStrategies>,
        plugins: StagePlugins,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            engine,
            breakers,
            bus,
            store,
            strategies,
            plugins,
            trading_enabled: config.trading_enabled,
            max_consecutive_errors: config.breaker.max_consecutive_cycle_errors,
            consecutive_errors: AtomicU32::new(0),
            cycles_run: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Cycle driver
    // -------------------------------------------------------------------------

    /// Run one full cycle for `(symbol, timeframe)` and return the final
    /// state (already persisted).
    #[instrument(skip(self), name = "orchestrator::run_cycle")]
    pub async fn run_cycle(&self, symbol: &str, timeframe: &str) -> CycleState {
        let mut state = CycleState::new(symbol, timeframe);
        self.cycles_run.fetch_add(1, Ordering::Relaxed);

        // Cycle breaker gate: no stage runs while `execution` is open.
        if self.breakers.is_open(EXECUTION_BREAKER) {
            state.advance_to(CycleStep::SkippedCircuitBreaker);
            state
                .thoughts
                .push("execution breaker open — cycle skipped".to_string());
            self.store.save_trace(&state.to_trace());
            return state;
        }

        self.bus.publish(
            Channel::CycleStart,
            serde_json::json!({
                "cycleId": state.cycle_id,
                "symbol": symbol,
                "timeframe": timeframe,
            }),
        );

        let mut stage_failed = false;
        let mut cycle_failed = false;

        stage_failed |= self
            .run_soft_stage(&mut state, CycleStep::MarketData, "market-data")
            .await;

        // Gating: not enough history is a clean abort, not an error.
        if state.candles.len() < MIN_CANDLES || state.indicators.is_none() {
            state.thoughts.push(format!(
                "insufficient market data ({} candles, indicators {}) — aborting cleanly",
                state.candles.len(),
                if state.indicators.is_some() { "ready" } else { "missing" },
            ));
            return self.finish(state, stage_failed, false);
        }

        stage_failed |= self
            .run_soft_stage(&mut state, CycleStep::PatternRecall, "pattern-recall")
            .await;
        stage_failed |= self
            .run_soft_stage(&mut state, CycleStep::StrategyIdeation, "strategy-ideation")
            .await;
        stage_failed |= self
            .run_soft_stage(&mut state, CycleStep::Backtester, "backtester")
            .await;
        stage_failed |= self
            .run_soft_stage(&mut state, CycleStep::StrategySelector, "strategy-selector")
            .await;

        if let Some(selected) = &state.selected_strategy {
            self.strategies.note(&selected.id, &state.symbol);
        }

        // CRITICAL: risk gate.
        if self
            .run_hard_stage(&mut state, CycleStep::RiskGate, "risk-gate")
            .await
            .is_err()
        {
            cycle_failed = true;
        }

        // Execute iff the gate and the signal agree.
        let approved = state
            .risk_assessment
            .as_ref()
            .map(|r| r.approved)
            .unwrap_or(false);
        if !cycle_failed && state.should_execute && state.signal.is_some() && approved {
            match self
                .run_hard_stage(&mut state, CycleStep::Execution, "executor")
                .await
            {
                Ok(()) => {
                    // Any executor completion that is not an exception —
                    // filled, resting, or cleanly rejected — resets the
                    // consecutive-error budget.
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    if state.should_learn && state.execution_result.is_some() {
                        stage_failed |= self
                            .run_soft_stage(&mut state, CycleStep::Learning, "learner")
                            .await;
                    }
                }
                Err(_) => cycle_failed = true,
            }
        }

        self.finish(state, stage_failed, cycle_failed)
    }

    fn finish(&self, mut state: CycleState, stage_failed: bool, cycle_failed: bool) -> CycleState {
        if cycle_failed {
            state.advance_to(CycleStep::Error);
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(
                Channel::CycleError,
                serde_json::json!({
                    "cycleId": state.cycle_id,
                    "symbol": state.symbol,
                    "step": state.current_step,
                    "errors": state.errors,
                }),
            );
        } else {
            state.advance_to(CycleStep::Done);
            self.bus.publish(
                Channel::CycleComplete,
                serde_json::json!({
                    "cycleId": state.cycle_id,
                    "symbol": state.symbol,
                    "executed": state.execution_result.is_some(),
                }),
            );
        }

        if stage_failed || cycle_failed {
            self.note_cycle_error();
        }

        self.store.save_trace(&state.to_trace());
        debug!(
            cycle_id = %state.cycle_id,
            symbol = %state.symbol,
            step = %state.current_step,
            thoughts = state.thoughts.len(),
            errors = state.errors.len(),
            "cycle finished"
        );
        state
    }

    fn note_cycle_error(&self) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(consecutive_errors = errors, "cycle recorded a stage failure");
        if errors >= self.max_consecutive_errors {
            warn!(
                errors,
                budget = self.max_consecutive_errors,
                "consecutive-error budget exhausted — forcing execution breaker open"
            );
            self.breakers.force_open(EXECUTION_BREAKER);
        }
    }

    // -------------------------------------------------------------------------
    // Stage execution
    // -------------------------------------------------------------------------

    /// Run a non-critical stage through its breaker; failures degrade to a
    /// sentinel patch. Returns whether the stage failed.
    async fn run_soft_stage(
        &self,
        state: &mut CycleState,
        step: CycleStep,
        breaker_name: &str,
    ) -> bool {
        state.advance_to(step);
        let failed = AtomicBool::new(false);
        let patch = {
            let state_ref: &CycleState = state;
            self.breakers
                .execute_with_fallback(
                    breaker_name,
                    || self.dispatch(step, state_ref),
                    |err| {
                        failed.store(true, Ordering::SeqCst);
                        let stage_error = EngineError::Stage {
                            stage: breaker_name.to_string(),
                            message: err.to_string(),
                        };
                        StagePatch {
                            errors: vec![stage_error.to_string()],
                            ..StagePatch::default()
                        }
                        .with_thought(format!("{breaker_name} degraded — continuing without it"))
                    },
                )
                .await
        };
        state.apply(patch);
        failed.load(Ordering::SeqCst)
    }

    /// Run a CRITICAL stage; failure aborts the cycle.
    async fn run_hard_stage(
        &self,
        state: &mut CycleState,
        step: CycleStep,
        breaker_name: &str,
    ) -> Result<(), EngineError> {
        state.advance_to(step);
        let result = {
            let state_ref: &CycleState = state;
            self.breakers
                .execute(breaker_name, || self.dispatch(step, state_ref))
                .await
        };
        match result {
            Ok(patch) => {
                state.apply(patch);
                Ok(())
            }
            Err(err) => {
                let stage_error = EngineError::Stage {
                    stage: breaker_name.to_string(),
                    message: err.to_string(),
                };
                state.errors.push(stage_error.to_string());
                warn!(stage = breaker_name, error = %err, "critical stage failed — aborting cycle");
                Err(stage_error)
            }
        }
    }

    async fn dispatch(
        &self,
        step: CycleStep,
        state: &CycleState,
    ) -> Result<StagePatch, EngineError> {
        match step {
            CycleStep::MarketData => self.stage_market_data(state).await,
            CycleStep::PatternRecall => self.stage_pattern_recall(state),
            CycleStep::StrategyIdeation => self.stage_ideation(state),
            CycleStep::Backtester => self.stage_backtester(state),
            CycleStep::StrategySelector => self.stage_selector(state),
            CycleStep::RiskGate => self.stage_risk_gate(state),
            CycleStep::Execution => self.stage_execution(state).await,
            CycleStep::Learning => self.stage_learning(state),
            other => Err(EngineError::Stage {
                stage: other.to_string(),
                message: "not a runnable stage".to_string(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    async fn stage_market_data(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let candles = self
            .client
            .get_candles(&state.symbol, &state.timeframe, CANDLE_WINDOW)
            .await?;
        let indicators = IndicatorSet::compute(&candles);
        let regime = indicators.as_ref().map(|i| i.regime());

        // Observe-only deployments have no account to snapshot.
        let portfolio = self.client.get_account_state().await.ok();

        let mut patch = StagePatch {
            thoughts: vec![format!(
                "market data: {} candles, regime {}",
                candles.len(),
                regime.map(|r| r.to_string()).unwrap_or_else(|| "n/a".to_string()),
            )],
            candles: Some(candles),
            indicators,
            regime,
            ..StagePatch::default()
        };
        patch.portfolio = portfolio;
        Ok(patch)
    }

    fn stage_pattern_recall(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let matches = self.plugins.patterns.recall(state);
        if matches.is_empty() {
            return Ok(StagePatch::thought("no similar patterns recalled"));
        }

        let weight: f64 = matches.iter().map(|m| m.similarity).sum();
        let bias = matches
            .iter()
            .map(|m| m.bias * m.similarity)
            .sum::<f64>()
            / weight.max(f64::EPSILON);
        let avg_return =
            matches.iter().map(|m| m.avg_return).sum::<f64>() / matches.len() as f64;

        Ok(StagePatch {
            thoughts: vec![format!(
                "{} similar patterns, bias {bias:.2}, avg return {avg_return:.4}",
                matches.len()
            )],
            similar_patterns: Some(matches),
            pattern_bias: Some(bias),
            pattern_avg_return: Some(avg_return),
            ..StagePatch::default()
        })
    }

    fn stage_ideation(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let ideas = self.plugins.ideator.ideate(state);
        Ok(StagePatch {
            thoughts: vec![format!("{} strategy ideas", ideas.len())],
            strategy_ideas: Some(ideas),
            ..StagePatch::default()
        })
    }

    fn stage_backtester(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let results: Vec<_> = state
            .strategy_ideas
            .iter()
            .map(|idea| self.plugins.backtester.backtest(idea, &state.candles))
            .collect();
        Ok(StagePatch {
            thoughts: vec![format!("backtested {} ideas", results.len())],
            backtest_results: Some(results),
            ..StagePatch::default()
        })
    }

    fn stage_selector(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let Some(idea) = self.plugins.selector.select(state) else {
            return Ok(StagePatch::thought("no strategy survived selection"));
        };

        let price = state
            .indicators
            .as_ref()
            .map(|i| i.last_close)
            .unwrap_or(0.0);
        let mut signal = Signal::new(
            idea.id.clone(),
            state.symbol.clone(),
            idea.action,
            0.0,
            price,
            idea.confidence,
            idea.reason.clone(),
        );
        signal.order_type = OrderType::Market;

        Ok(StagePatch {
            thoughts: vec![format!(
                "selected {} ({} conf {:.2})",
                idea.name, idea.action, idea.confidence
            )],
            selected_strategy: Some(idea),
            signal: Some(signal),
            ..StagePatch::default()
        })
    }

    fn stage_risk_gate(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        if state.signal.is_none() {
            return Ok(StagePatch {
                should_execute: Some(false),
                ..StagePatch::default()
            }
            .with_thought("no signal to assess"));
        }

        let assessment = self.plugins.risk.assess(state);
        let approved = assessment.approved;
        let should_execute = approved && self.trading_enabled;

        let mut patch = StagePatch {
            thoughts: vec![if approved {
                format!(
                    "risk approved: size {:.6}, sl {:.2}%, tp {:.2}%",
                    assessment.suggested_size,
                    assessment.stop_loss * 100.0,
                    assessment.take_profit * 100.0,
                )
            } else {
                format!("risk rejected: {}", assessment.warnings.join("; "))
            }],
            risk_assessment: Some(assessment),
            should_execute: Some(should_execute),
            ..StagePatch::default()
        };
        if approved && !self.trading_enabled {
            patch = patch.with_thought("trading disabled — signal not executed");
        }
        Ok(patch)
    }

    async fn stage_execution(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        // Gating guarantees both are present here.
        let (Some(signal), Some(risk)) = (&state.signal, &state.risk_assessment) else {
            return Err(EngineError::Stage {
                stage: "executor".to_string(),
                message: "execution reached without signal or assessment".to_string(),
            });
        };

        let outcome = self.engine.execute_signal(signal, risk).await;
        let record = match outcome {
            crate::engine::ExecutionOutcome::Filled { trade, order_id } => ExecutionRecord {
                status: ExecutionStatus::Filled,
                order_id: Some(order_id),
                avg_px: trade.price,
                size: trade.size,
                message: "filled".to_string(),
            },
            crate::engine::ExecutionOutcome::Resting { order_id } => ExecutionRecord {
                status: ExecutionStatus::Resting,
                order_id: Some(order_id),
                avg_px: 0.0,
                size: 0.0,
                message: "resting".to_string(),
            },
            crate::engine::ExecutionOutcome::Rejected { reason, message } => ExecutionRecord {
                status: ExecutionStatus::Rejected,
                order_id: None,
                avg_px: 0.0,
                size: 0.0,
                message: format!("{reason}: {message}"),
            },
            // Infrastructure failures count against the executor breaker.
            crate::engine::ExecutionOutcome::Failed { error } => return Err(error),
        };

        Ok(StagePatch {
            thoughts: vec![format!("execution: {}", record.message)],
            execution_result: Some(record),
            ..StagePatch::default()
        })
    }

    fn stage_learning(&self, state: &CycleState) -> Result<StagePatch, EngineError> {
        let (Some(signal), Some(regime)) = (&state.signal, state.regime) else {
            return Ok(StagePatch::thought("nothing to learn from"));
        };

        // The realized outcome is not known at fill time; seed the store with
        // the backtest's per-trade expectation as a prior.
        let expected_return = state
            .selected_strategy
            .as_ref()
            .and_then(|idea| {
                state
                    .backtest_results
                    .iter()
                    .find(|r| r.strategy_id == idea.id)
            })
            .map(|r| {
                if r.trades > 0 {
                    r.total_return / r.trades as f64
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        self.plugins.patterns.learn(&PatternOutcome {
            symbol: state.symbol.clone(),
            regime,
            action: signal.action,
            realized_return: expected_return,
        });

        Ok(StagePatch::thought(format!(
            "learned {} outcome prior {expected_return:.4} for regime {regime}",
            signal.action
        )))
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    pub fn get_health_status(&self) -> HealthSummary {
        if self.breakers.is_open(EXECUTION_BREAKER) {
            return HealthSummary::Critical;
        }
        let summary = self.breakers.health_summary();
        if summary == HealthSummary::Healthy
            && self.consecutive_errors.load(Ordering::SeqCst) > 0
        {
            return HealthSummary::Degraded;
        }
        summary
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }
}

/// Drive one `(symbol, timeframe)` pair on a periodic tick until shutdown.
pub async fn run_cycle_worker(
    orchestrator: Arc<TradingOrchestrator>,
    symbol: String,
    timeframe: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(symbol = %symbol, timeframe = %timeframe, every_secs = every.as_secs(), "cycle worker started");
    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = orchestrator.run_cycle(&symbol, &timeframe).await;
                debug!(
                    symbol = %symbol,
                    step = %state.current_step,
                    "cycle worker tick complete"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(symbol = %symbol, "cycle worker stopping");
                    return;
                }
            }
        }
    }
}
