// =============================================================================
// Execution Engine — the signal-to-order gatekeeper
// =============================================================================
//
// Every signal that wants to become an order passes through here: exit
// classification, duplicate detection, per-symbol rate limits and cooldowns,
// the safety multiplier, and reduce-only routing. Entries face every gate;
// exits bypass them all — failing to close a position is the dangerous
// direction.
//
// Cooldown stamps and fingerprints are recorded *before* the order is
// submitted so a concurrent duplicate cannot race past the gates.
// =============================================================================

pub mod exits;
pub mod portfolio;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::bus::{Channel, MessageBus};
use crate::config::{ChurnConfig, EngineConfig, EngineLimits};
use crate::error::EngineError;
use crate::exchange::client::{HyperliquidClient, OpenOrder, OrderOutcome, OrderRequest};
use crate::exchange::churn::SymbolStatsSnapshot;
use crate::persistence::TraceStore;
use crate::types::{
    Action, EntryExit, Portfolio, Position, RejectReason, RiskAssessment, Signal, Side, Trade,
    TradeStatus,
};

use self::portfolio::TradeLog;

/// Strategy ids whose signals always carry exit intent.
pub const STRATEGY_POSITION_RECOVERY: &str = "position-recovery";
pub const STRATEGY_RISK_MANAGED_EXIT: &str = "risk-managed-exit";

// =============================================================================
// Types
// =============================================================================

/// An internal stop-loss / take-profit plan created on entry fill and
/// monitored until the position leaves the book.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedExitPlan {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Stop-loss distance as a fraction of entry.
    pub stop_loss_pct: f64,
    /// Take-profit distance as a fraction of entry.
    pub take_profit_pct: f64,
    pub created_at: i64,
}

/// Last accepted signal per symbol, for duplicate detection.
#[derive(Debug, Clone)]
struct SignalFingerprint {
    action: Action,
    price: f64,
    confidence: f64,
    reason: String,
    at: Instant,
}

/// Result of routing one signal.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Filled { trade: Trade, order_id: u64 },
    Resting { order_id: u64 },
    Rejected { reason: RejectReason, message: String },
    Failed { error: EngineError },
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }

    fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled { trade, order_id } => {
                write!(f, "Filled(oid={order_id}, px={}, sz={})", trade.price, trade.size)
            }
            Self::Resting { order_id } => write!(f, "Resting(oid={order_id})"),
            Self::Rejected { reason, message } => write!(f, "Rejected({reason}: {message})"),
            Self::Failed { error } => write!(f, "Failed({error})"),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct ExecutionEngine {
    client: Arc<HyperliquidClient>,
    bus: Arc<MessageBus>,
    store: Arc<dyn TraceStore>,
    limits: EngineLimits,
    churn: ChurnConfig,

    trades: TradeLog,
    exit_plans: RwLock<HashMap<String, ManagedExitPlan>>,

    fingerprints: Mutex<HashMap<String, SignalFingerprint>>,
    signal_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    last_order_time: Mutex<HashMap<String, Instant>>,
    exits_in_flight: Mutex<HashSet<String>>,

    /// Position-size multiplier in [0, 1] applied to entries; 0 blocks them.
    safety_multiplier: Mutex<f64>,
    emergency_stopped: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<HyperliquidClient>,
        bus: Arc<MessageBus>,
        store: Arc<dyn TraceStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            bus,
            store,
            limits: config.engine.clone(),
            churn: config.churn.clone(),
            trades: TradeLog::new(),
            exit_plans: RwLock::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            signal_windows: Mutex::new(HashMap::new()),
            last_order_time: Mutex::new(HashMap::new()),
            exits_in_flight: Mutex::new(HashSet::new()),
            safety_multiplier: Mutex::new(1.0),
            emergency_stopped: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Signal routing
    // -------------------------------------------------------------------------

    /// Route one signal through admission and down to the exchange client.
    #[instrument(skip(self, signal, risk), name = "engine::execute_signal", fields(symbol = %signal.symbol, action = %signal.action))]
    pub async fn execute_signal(
        &self,
        signal: &Signal,
        risk: &RiskAssessment,
    ) -> ExecutionOutcome {
        // 1. HOLD carries no order.
        if signal.action == Action::Hold {
            return ExecutionOutcome::rejected(RejectReason::HoldSignal, "HOLD signal");
        }
        if self.emergency_stopped.load(Ordering::SeqCst) {
            return self.reject_and_publish(
                signal,
                RejectReason::EmergencyStop,
                "emergency stop active",
            );
        }

        // 2. Locate any existing position for the symbol.
        let portfolio = match self.client.get_account_state().await {
            Ok(p) => p,
            Err(error) => return self.fail_and_publish(signal, error),
        };
        let position = portfolio.position(&signal.symbol).cloned();

        // 3–4. Direction and intent classification.
        let is_exit_order = position
            .as_ref()
            .map(|p| signal.action == p.side.exit_action())
            .unwrap_or(false);
        let exit_intent = risk.is_exit_intent()
            || signal.strategy_id == STRATEGY_POSITION_RECOVERY
            || signal.strategy_id == STRATEGY_RISK_MANAGED_EXIT;
        if exit_intent && position.is_none() && !is_exit_order {
            return self.reject_and_publish(
                signal,
                RejectReason::NoPositionToClose,
                "No open position to close",
            );
        }

        // 5. Entry gates. Exits bypass everything below.
        let multiplier = *self.safety_multiplier.lock();
        if !is_exit_order {
            if signal.confidence < self.churn.min_confidence {
                return self.reject_and_publish(
                    signal,
                    RejectReason::BelowMinConfidence,
                    format!(
                        "confidence {:.2} below minimum {:.2}",
                        signal.confidence, self.churn.min_confidence
                    ),
                );
            }
            if let Err(outcome) = self.check_duplicate(signal) {
                return self.publish_outcome_failed(signal, outcome);
            }
            if let Err(outcome) = self.check_rate_limit(&signal.symbol) {
                return self.publish_outcome_failed(signal, outcome);
            }
            if let Err(outcome) = self.check_cooldowns(&signal.symbol) {
                return self.publish_outcome_failed(signal, outcome);
            }
            if multiplier <= 0.0 {
                return self.reject_and_publish(
                    signal,
                    RejectReason::SafetyMultiplierZero,
                    "safety monitor blocks new entries",
                );
            }
        }

        // 6. Size resolution.
        let base_size = if risk.suggested_size > 0.0 {
            risk.suggested_size
        } else {
            signal.size
        };
        let adjusted_size = if is_exit_order {
            let cap = position.as_ref().map(|p| p.size).unwrap_or(base_size);
            base_size.min(cap)
        } else {
            base_size * multiplier
        };

        // 7. Stamp cooldown/fingerprint state before the order leaves, so a
        // concurrent duplicate cannot race past the gates.
        self.note_submission(signal, is_exit_order);

        // 8. Route to the exchange.
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            action: signal.action,
            size: adjusted_size,
            price: signal.price,
            order_type: signal.order_type,
            reduce_only: is_exit_order,
            confidence: signal.confidence,
            client_order_id: Some(signal.id.clone()),
        };
        let outcome = self.client.place_order(request).await;

        match outcome {
            OrderOutcome::Filled {
                order_id,
                avg_px,
                size,
            } => self.on_filled(signal, risk, position.as_ref(), is_exit_order, order_id, avg_px, size),
            OrderOutcome::Resting { order_id } => {
                info!(symbol = %signal.symbol, order_id, "signal resting on the book");
                ExecutionOutcome::Resting { order_id }
            }
            OrderOutcome::Rejected { reason, message } => {
                self.reject_and_publish(signal, reason, message)
            }
            OrderOutcome::Failed { error } => self.fail_and_publish(signal, error),
        }
    }

    /// 9–12: persist the trade, maintain the exit plan, publish events.
    #[allow(clippy::too_many_arguments)]
    fn on_filled(
        &self,
        signal: &Signal,
        risk: &RiskAssessment,
        position: Option<&Position>,
        is_exit_order: bool,
        order_id: u64,
        avg_px: f64,
        size: f64,
    ) -> ExecutionOutcome {
        let pnl = if is_exit_order {
            position
                .map(|p| {
                    let direction = if p.side == Side::Long { 1.0 } else { -1.0 };
                    (avg_px - p.entry_price) * size * direction
                })
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action,
            size,
            price: avg_px,
            fee: 0.0,
            pnl,
            timestamp: chrono::Utc::now().timestamp_millis(),
            order_type: signal.order_type,
            status: TradeStatus::Filled,
            entry_exit: if is_exit_order {
                EntryExit::Exit
            } else {
                EntryExit::Entry
            },
        };
        self.store.save_trade(&trade);
        self.trades.record(trade.clone());

        if is_exit_order {
            self.exit_plans.write().remove(&signal.symbol);
            self.bus.publish(
                Channel::PositionClosed,
                serde_json::json!({
                    "symbol": signal.symbol,
                    "price": avg_px,
                    "size": size,
                    "pnl": pnl,
                    "strategyId": signal.strategy_id,
                }),
            );
        } else {
            // A managed-exit plan only makes sense with real levels.
            if risk.stop_loss > 0.0 || risk.take_profit > 0.0 {
                if let Some(side) = signal.action.opens() {
                    self.exit_plans.write().insert(
                        signal.symbol.clone(),
                        ManagedExitPlan {
                            symbol: signal.symbol.clone(),
                            side,
                            entry_price: avg_px,
                            stop_loss_pct: risk.stop_loss,
                            take_profit_pct: risk.take_profit,
                            created_at: chrono::Utc::now().timestamp_millis(),
                        },
                    );
                }
            }
            self.bus.publish(
                Channel::PositionOpened,
                serde_json::json!({
                    "symbol": signal.symbol,
                    "price": avg_px,
                    "size": size,
                    "side": signal.action,
                    "strategyId": signal.strategy_id,
                }),
            );
        }

        self.bus.publish(
            Channel::ExecutionFilled,
            serde_json::json!({
                "signalId": signal.id,
                "symbol": signal.symbol,
                "orderId": order_id,
                "price": avg_px,
                "size": size,
                "entryExit": if is_exit_order { "EXIT" } else { "ENTRY" },
            }),
        );

        info!(
            symbol = %signal.symbol,
            order_id,
            avg_px,
            size,
            exit = is_exit_order,
            "signal filled"
        );
        ExecutionOutcome::Filled { trade, order_id }
    }

    // -------------------------------------------------------------------------
    // Entry gates (unit-testable without a venue)
    // -------------------------------------------------------------------------

    /// Duplicate when the previous signal on this symbol is inside the dedup
    /// window, has the same action, and either barely moved in price or
    /// carries the same reason at similar confidence.
    fn check_duplicate(&self, signal: &Signal) -> Result<(), ExecutionOutcome> {
        let fingerprints = self.fingerprints.lock();
        let Some(prev) = fingerprints.get(&signal.symbol) else {
            return Ok(());
        };
        if prev.at.elapsed() > Duration::from_secs(self.limits.signal_dedup_window_secs) {
            return Ok(());
        }
        if prev.action != signal.action {
            return Ok(());
        }

        let price_move = if prev.price > 0.0 {
            (signal.price - prev.price).abs() / prev.price
        } else {
            f64::INFINITY
        };
        let similar_price = price_move < self.limits.dup_price_tolerance;
        let similar_meaning = (signal.confidence - prev.confidence).abs()
            < self.limits.dup_confidence_tolerance
            && signal.reason == prev.reason;

        if similar_price || similar_meaning {
            return Err(ExecutionOutcome::rejected(
                RejectReason::DuplicateSignal,
                format!(
                    "Duplicate signal: {} {} within {}s (price move {:.2}%)",
                    signal.action,
                    signal.symbol,
                    self.limits.signal_dedup_window_secs,
                    price_move * 100.0
                ),
            ));
        }
        Ok(())
    }

    /// Rolling 60 s per-symbol signal budget.
    fn check_rate_limit(&self, symbol: &str) -> Result<(), ExecutionOutcome> {
        let mut windows = self.signal_windows.lock();
        let window = windows.entry(symbol.to_string()).or_default();
        let cutoff = Instant::now() - Duration::from_secs(60);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() >= self.limits.max_signals_per_minute as usize {
            return Err(ExecutionOutcome::rejected(
                RejectReason::RateLimited,
                format!(
                    "{symbol}: {} signals in the last minute (max {})",
                    window.len(),
                    self.limits.max_signals_per_minute
                ),
            ));
        }
        Ok(())
    }

    /// Engine-level min-interval and standard cooldown between entries.
    fn check_cooldowns(&self, symbol: &str) -> Result<(), ExecutionOutcome> {
        let last = self.last_order_time.lock().get(symbol).copied();
        let Some(last) = last else { return Ok(()) };
        let elapsed = last.elapsed().as_secs();

        if elapsed < self.churn.min_order_interval_secs {
            return Err(ExecutionOutcome::rejected(
                RejectReason::MinInterval,
                format!(
                    "{symbol}: {elapsed}s since last order, minimum {}s",
                    self.churn.min_order_interval_secs
                ),
            ));
        }
        if elapsed < self.churn.cooldown_secs {
            return Err(ExecutionOutcome::rejected(
                RejectReason::Cooldown,
                format!(
                    "{symbol}: cooldown {}s, {elapsed}s elapsed",
                    self.churn.cooldown_secs
                ),
            ));
        }
        Ok(())
    }

    /// Stamp the per-symbol admission state for this signal.
    fn note_submission(&self, signal: &Signal, is_exit_order: bool) {
        if is_exit_order {
            return;
        }
        let now = Instant::now();
        self.last_order_time
            .lock()
            .insert(signal.symbol.clone(), now);
        self.fingerprints.lock().insert(
            signal.symbol.clone(),
            SignalFingerprint {
                action: signal.action,
                price: signal.price,
                confidence: signal.confidence,
                reason: signal.reason.clone(),
                at: now,
            },
        );
        self.signal_windows
            .lock()
            .entry(signal.symbol.clone())
            .or_default()
            .push_back(now);
    }

    // -------------------------------------------------------------------------
    // Publication helpers
    // -------------------------------------------------------------------------

    fn reject_and_publish(
        &self,
        signal: &Signal,
        reason: RejectReason,
        message: impl Into<String>,
    ) -> ExecutionOutcome {
        let message = message.into();
        warn!(symbol = %signal.symbol, %reason, message = %message, "signal rejected");
        self.bus.publish(
            Channel::ExecutionFailed,
            serde_json::json!({
                "signalId": signal.id,
                "symbol": signal.symbol,
                "reason": reason,
                "message": message,
            }),
        );
        ExecutionOutcome::Rejected { reason, message }
    }

    fn fail_and_publish(&self, signal: &Signal, error: EngineError) -> ExecutionOutcome {
        warn!(symbol = %signal.symbol, error = %error, "signal failed");
        self.bus.publish(
            Channel::ExecutionFailed,
            serde_json::json!({
                "signalId": signal.id,
                "symbol": signal.symbol,
                "reason": "ERROR",
                "message": error.to_string(),
            }),
        );
        ExecutionOutcome::Failed { error }
    }

    fn publish_outcome_failed(
        &self,
        signal: &Signal,
        outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        if let ExecutionOutcome::Rejected { reason, message } = &outcome {
            return self.reject_and_publish(signal, *reason, message.clone());
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // Public surface for the API, monitor, and recovery
    // -------------------------------------------------------------------------

    pub async fn get_portfolio(&self) -> Result<Portfolio, EngineError> {
        self.client.get_account_state().await
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, EngineError> {
        Ok(self.get_portfolio().await?.positions)
    }

    pub fn get_realized_pnl(&self) -> f64 {
        self.trades.realized_pnl()
    }

    pub fn get_recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.trades.recent(limit)
    }

    pub fn recent_trades_for_symbol(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        self.trades.recent_for_symbol(symbol, limit)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), EngineError> {
        self.client.cancel_order(symbol, order_id).await
    }

    pub async fn get_open_orders(&self) -> Result<Arc<Vec<OpenOrder>>, EngineError> {
        self.client.get_open_orders().await
    }

    pub fn get_anti_churn_stats(&self) -> Vec<SymbolStatsSnapshot> {
        self.client.order_stats()
    }

    pub fn set_safety_multiplier(&self, multiplier: f64) {
        *self.safety_multiplier.lock() = multiplier.clamp(0.0, 1.0);
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped.load(Ordering::SeqCst)
    }

    /// Close every position and cancel every order, then refuse new entries
    /// until the process restarts.
    #[instrument(skip(self), name = "engine::emergency_stop")]
    pub async fn emergency_stop(&self) -> (usize, usize) {
        self.emergency_stopped.store(true, Ordering::SeqCst);
        warn!("EMERGENCY STOP — closing all positions and cancelling all orders");

        let cancelled = self.client.cancel_all_orders().await.unwrap_or_else(|e| {
            warn!(error = %e, "emergency cancel-all failed");
            0
        });

        let mut closed = 0usize;
        match self.client.get_account_state().await {
            Ok(portfolio) => {
                let mut closes = tokio::task::JoinSet::new();
                for position in portfolio.positions {
                    let client = self.client.clone();
                    closes.spawn(async move {
                        client.close_position_market(&position, position.size).await
                    });
                }
                while let Some(result) = closes.join_next().await {
                    if matches!(result, Ok(outcome) if outcome.is_filled()) {
                        closed += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "emergency stop could not read positions"),
        }

        self.exit_plans.write().clear();
        self.bus.publish(
            Channel::Error,
            serde_json::json!({
                "type": "EMERGENCY_STOP",
                "positionsClosed": closed,
                "ordersCancelled": cancelled,
            }),
        );
        (closed, cancelled)
    }

    // -------------------------------------------------------------------------
    // Managed-exit plan bookkeeping (consumed by the monitor)
    // -------------------------------------------------------------------------

    pub fn exit_plans(&self) -> Vec<ManagedExitPlan> {
        self.exit_plans.read().values().cloned().collect()
    }

    pub fn has_exit_plans(&self) -> bool {
        !self.exit_plans.read().is_empty()
    }

    pub fn drop_exit_plan(&self, symbol: &str) {
        if self.exit_plans.write().remove(symbol).is_some() {
            info!(symbol, "managed-exit plan dropped");
        }
    }

    pub fn register_exit_plan(&self, plan: ManagedExitPlan) {
        self.exit_plans.write().insert(plan.symbol.clone(), plan);
    }

    /// Per-symbol in-flight guard so the monitor never fires two concurrent
    /// exits for one symbol.
    pub fn try_begin_managed_exit(&self, symbol: &str) -> bool {
        self.exits_in_flight.lock().insert(symbol.to_string())
    }

    pub fn finish_managed_exit(&self, symbol: &str) {
        self.exits_in_flight.lock().remove(symbol);
    }

    pub fn exit_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.limits.exit_monitor_interval_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::OrderLedger;
    use crate::persistence::NullTraceStore;

    fn engine() -> ExecutionEngine {
        let bus = Arc::new(MessageBus::new());
        let config = EngineConfig::default();
        let ledger = Arc::new(OrderLedger::new(bus.clone()));
        let client = Arc::new(HyperliquidClient::new(&config, ledger, bus.clone()));
        ExecutionEngine::new(client, bus, Arc::new(NullTraceStore), &config)
    }

    fn signal(symbol: &str, action: Action, price: f64, confidence: f64, reason: &str) -> Signal {
        Signal::new("momentum-v1", symbol, action, 0.01, price, confidence, reason)
    }

    fn reason_of(outcome: ExecutionOutcome) -> RejectReason {
        match outcome {
            ExecutionOutcome::Rejected { reason, .. } => reason,
            other => panic!("expected rejection, got {other}"),
        }
    }

    #[test]
    fn duplicate_same_price_band_rejected() {
        let e = engine();
        // S2: ETH BUY at 3000 then 3005 (0.17 % move), similar confidence.
        let first = signal("ETH", Action::Buy, 3_000.0, 0.82, "breakout");
        e.note_submission(&first, false);

        let second = signal("ETH", Action::Buy, 3_005.0, 0.83, "breakout");
        let err = e.check_duplicate(&second).unwrap_err();
        assert_eq!(reason_of(err), RejectReason::DuplicateSignal);
    }

    #[test]
    fn duplicate_same_reason_similar_confidence_rejected() {
        let e = engine();
        let first = signal("ETH", Action::Buy, 3_000.0, 0.82, "breakout");
        e.note_submission(&first, false);

        // Price moved 2 % but same reason at similar confidence.
        let second = signal("ETH", Action::Buy, 3_060.0, 0.85, "breakout");
        let err = e.check_duplicate(&second).unwrap_err();
        assert_eq!(reason_of(err), RejectReason::DuplicateSignal);
    }

    #[test]
    fn different_action_is_not_duplicate() {
        let e = engine();
        let first = signal("ETH", Action::Buy, 3_000.0, 0.82, "breakout");
        e.note_submission(&first, false);

        let second = signal("ETH", Action::Sell, 3_001.0, 0.82, "breakout");
        assert!(e.check_duplicate(&second).is_ok());
    }

    #[test]
    fn moved_price_and_new_reason_is_fresh() {
        let e = engine();
        let first = signal("ETH", Action::Buy, 3_000.0, 0.82, "breakout");
        e.note_submission(&first, false);

        let second = signal("ETH", Action::Buy, 3_100.0, 0.95, "volume spike");
        assert!(e.check_duplicate(&second).is_ok());
    }

    #[test]
    fn rate_limit_caps_signals_per_minute() {
        let e = engine();
        for i in 0..3 {
            let s = signal("SOL", Action::Buy, 150.0 + i as f64, 0.9, "x");
            assert!(e.check_rate_limit("SOL").is_ok());
            e.note_submission(&s, false);
        }
        let err = e.check_rate_limit("SOL").unwrap_err();
        assert_eq!(reason_of(err), RejectReason::RateLimited);
    }

    #[test]
    fn exits_do_not_consume_admission_state() {
        let e = engine();
        let s = signal("SOL", Action::Sell, 150.0, 1.0, "exit");
        e.note_submission(&s, true);

        assert!(e.check_rate_limit("SOL").is_ok());
        assert!(e.check_cooldowns("SOL").is_ok());
        assert!(e.check_duplicate(&s).is_ok());
    }

    #[test]
    fn cooldown_blocks_fresh_entry() {
        let e = engine();
        let s = signal("BTC", Action::Buy, 50_000.0, 0.9, "x");
        e.note_submission(&s, false);

        let err = e.check_cooldowns("BTC").unwrap_err();
        assert_eq!(reason_of(err), RejectReason::MinInterval);
    }

    #[test]
    fn exit_plan_lifecycle() {
        let e = engine();
        assert!(!e.has_exit_plans());

        e.register_exit_plan(ManagedExitPlan {
            symbol: "BTC".to_string(),
            side: Side::Long,
            entry_price: 50_005.0,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.05,
            created_at: 0,
        });
        assert!(e.has_exit_plans());
        assert_eq!(e.exit_plans()[0].symbol, "BTC");

        e.drop_exit_plan("BTC");
        assert!(!e.has_exit_plans());
    }

    #[test]
    fn in_flight_guard_is_exclusive() {
        let e = engine();
        assert!(e.try_begin_managed_exit("BTC"));
        assert!(!e.try_begin_managed_exit("BTC"));
        e.finish_managed_exit("BTC");
        assert!(e.try_begin_managed_exit("BTC"));
    }

    #[test]
    fn safety_multiplier_clamped() {
        let e = engine();
        e.set_safety_multiplier(1.7);
        assert_eq!(*e.safety_multiplier.lock(), 1.0);
        e.set_safety_multiplier(-0.3);
        assert_eq!(*e.safety_multiplier.lock(), 0.0);
    }

    #[tokio::test]
    async fn hold_signal_never_reaches_the_client() {
        let e = engine();
        let s = signal("BTC", Action::Hold, 0.0, 1.0, "nothing to do");
        let risk = RiskAssessment {
            approved: true,
            suggested_size: 0.0,
            risk_score: 0.0,
            warnings: vec![],
            stop_loss: 0.0,
            take_profit: 0.0,
            leverage: 1,
        };
        let outcome = e.execute_signal(&s, &risk).await;
        assert_eq!(reason_of(outcome), RejectReason::HoldSignal);
    }
}
