// =============================================================================
// Position-Recovery Monitor — periodic scanner for positions in trouble
// =============================================================================
//
// Every 30 seconds each open position is classified into at most one issue:
//
//   EXCESSIVE_LOSS     unrealized / notional < -15 %      CLOSE   CRITICAL
//   ORPHANED           no active strategy holds it        CLOSE   HIGH
//   EXCESSIVE_LEVERAGE leverage > 50x                     REDUCE  HIGH
//   STUCK              >= 5 trades inside a 0.5 % range   REDUCE long / CLOSE short, MEDIUM
//   STALE              oldest recent trade > 24 h old     WAIT    LOW
//
// CLOSE / REDUCE verdicts land in batch buffers flushed concurrently every
// 2 seconds; attempts are capped per (symbol, side) and alerts deduplicated
// per (symbol, reason) for five minutes. The whole flow is gated by the
// `execution` breaker.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{CircuitBreakerRegistry, EXECUTION_BREAKER};
use crate::bus::{Channel, MessageBus};
use crate::cache::{SingleFlight, TtlCell};
use crate::config::RecoveryConfig;
use crate::engine::{ExecutionEngine, STRATEGY_POSITION_RECOVERY};
use crate::error::EngineError;
use crate::types::{Portfolio, Position, RiskAssessment, Side, Signal, Trade};

/// Loss fraction of entry notional at which a position is force-closed.
const EXCESSIVE_LOSS_FRACTION: f64 = -0.15;
/// Leverage above which a position is reduced.
const EXCESSIVE_LEVERAGE: u32 = 50;
/// Trades examined for the stuck test.
const STUCK_TRADE_COUNT: usize = 5;
/// Price range under which those trades count as stuck.
const STUCK_RANGE_FRACTION: f64 = 0.005;
/// Age of the oldest recent trade that marks a position stale.
const STALE_AGE_SECS: i64 = 24 * 3_600;
/// Fraction of the position closed by a REDUCE action.
const REDUCE_FRACTION: f64 = 0.5;
/// Portfolio/trade snapshots are shared across passes for this long.
const DATA_CACHE_SECS: u64 = 5;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IssueKind {
    #[serde(rename = "ORPHANED")]
    Orphaned,
    #[serde(rename = "EXCESSIVE_LOSS")]
    ExcessiveLoss,
    #[serde(rename = "STUCK")]
    Stuck,
    #[serde(rename = "EXCESSIVE_LEVERAGE")]
    ExcessiveLeverage,
    #[serde(rename = "STALE")]
    Stale,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Orphaned => "ORPHANED",
            Self::ExcessiveLoss => "EXCESSIVE_LOSS",
            Self::Stuck => "STUCK",
            Self::ExcessiveLeverage => "EXCESSIVE_LEVERAGE",
            Self::Stale => "STALE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryAction {
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "REDUCE")]
    Reduce,
    #[serde(rename = "WAIT")]
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum IssuePriority {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

/// One classified problem on one position.
#[derive(Debug, Clone, Serialize)]
pub struct PositionIssue {
    pub symbol: String,
    pub side: Side,
    pub kind: IssueKind,
    pub action: RecoveryAction,
    pub priority: IssuePriority,
    pub detail: String,
}

/// A queued CLOSE/REDUCE waiting for the next batch flush.
#[derive(Debug, Clone)]
struct RecoveryTask {
    position: Position,
    action: RecoveryAction,
    kind: IssueKind,
}

/// Registry of strategies currently holding symbols, fed by the orchestrator.
pub struct ActiveStrategies {
    symbols: RwLock<HashMap<String, HashSet<String>>>,
}

impl ActiveStrategies {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    pub fn note(&self, strategy_id: &str, symbol: &str) {
        self.symbols
            .write()
            .entry(symbol.to_string())
            .or_default()
            .insert(strategy_id.to_string());
    }

    pub fn references(&self, symbol: &str) -> bool {
        self.symbols
            .read()
            .get(symbol)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

impl Default for ActiveStrategies {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable monitor status for the API.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub issues_found: u64,
    pub actions_queued: u64,
    pub actions_executed: u64,
    pub pending_close: usize,
    pub pending_reduce: usize,
    pub attempts: HashMap<String, u32>,
}

// =============================================================================
// Classification (pure, unit-tested)
// =============================================================================

/// Classify one position. `recent_trades` is newest-first for the symbol.
pub fn classify_position(
    position: &Position,
    is_referenced: bool,
    recent_trades: &[Trade],
    now_millis: i64,
) -> Option<PositionIssue> {
    let notional = position.entry_notional();
    if notional > 0.0 {
        let loss_fraction = position.unrealized_pnl / notional;
        if loss_fraction < EXCESSIVE_LOSS_FRACTION {
            return Some(PositionIssue {
                symbol: position.symbol.clone(),
                side: position.side,
                kind: IssueKind::ExcessiveLoss,
                action: RecoveryAction::Close,
                priority: IssuePriority::Critical,
                detail: format!("unrealized loss {:.1}% of notional", loss_fraction * 100.0),
            });
        }
    }

    if !is_referenced {
        return Some(PositionIssue {
            symbol: position.symbol.clone(),
            side: position.side,
            kind: IssueKind::Orphaned,
            action: RecoveryAction::Close,
            priority: IssuePriority::High,
            detail: "no active strategy references this symbol".to_string(),
        });
    }

    if position.leverage > EXCESSIVE_LEVERAGE {
        return Some(PositionIssue {
            symbol: position.symbol.clone(),
            side: position.side,
            kind: IssueKind::ExcessiveLeverage,
            action: RecoveryAction::Reduce,
            priority: IssuePriority::High,
            detail: format!("leverage {}x above {EXCESSIVE_LEVERAGE}x", position.leverage),
        });
    }

    if recent_trades.len() >= STUCK_TRADE_COUNT {
        let prices: Vec<f64> = recent_trades
            .iter()
            .take(STUCK_TRADE_COUNT)
            .map(|t| t.price)
            .collect();
        let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if min > 0.0 && (max - min) / min < STUCK_RANGE_FRACTION {
            let action = match position.side {
                Side::Long => RecoveryAction::Reduce,
                Side::Short => RecoveryAction::Close,
            };
            return Some(PositionIssue {
                symbol: position.symbol.clone(),
                side: position.side,
                kind: IssueKind::Stuck,
                action,
                priority: IssuePriority::Medium,
                detail: format!(
                    "last {STUCK_TRADE_COUNT} trades inside {:.2}% range",
                    (max - min) / min * 100.0
                ),
            });
        }
    }

    if let Some(oldest) = recent_trades.last() {
        let age_secs = (now_millis - oldest.timestamp) / 1_000;
        if age_secs > STALE_AGE_SECS {
            return Some(PositionIssue {
                symbol: position.symbol.clone(),
                side: position.side,
                kind: IssueKind::Stale,
                action: RecoveryAction::Wait,
                priority: IssuePriority::Low,
                detail: format!("oldest recent trade is {}h old", age_secs / 3_600),
            });
        }
    }

    None
}

// =============================================================================
// Monitor
// =============================================================================

pub struct PositionRecoveryMonitor {
    engine: Arc<ExecutionEngine>,
    bus: Arc<MessageBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    strategies: Arc<ActiveStrategies>,
    cfg: RecoveryConfig,

    attempts: Mutex<HashMap<(String, Side), u32>>,
    alerts: Mutex<HashMap<(String, IssueKind), Instant>>,
    close_queue: Mutex<Vec<RecoveryTask>>,
    reduce_queue: Mutex<Vec<RecoveryTask>>,
    portfolio_cache: TtlCell<Portfolio>,
    trade_cache: SingleFlight<String, Vec<Trade>>,

    issues_found: Mutex<u64>,
    actions_queued: Mutex<u64>,
    actions_executed: Mutex<u64>,
}

impl PositionRecoveryMonitor {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        bus: Arc<MessageBus>,
        breakers: Arc<CircuitBreakerRegistry>,
        strategies: Arc<ActiveStrategies>,
        cfg: RecoveryConfig,
    ) -> Self {
        Self {
            engine,
            bus,
            breakers,
            strategies,
            cfg,
            attempts: Mutex::new(HashMap::new()),
            alerts: Mutex::new(HashMap::new()),
            close_queue: Mutex::new(Vec::new()),
            reduce_queue: Mutex::new(Vec::new()),
            portfolio_cache: TtlCell::new(Duration::from_secs(DATA_CACHE_SECS)),
            trade_cache: SingleFlight::new(Duration::from_secs(DATA_CACHE_SECS)),
            issues_found: Mutex::new(0),
            actions_queued: Mutex::new(0),
            actions_executed: Mutex::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Data fetch (shared, cached 5 s across scan/flush/manual passes)
    // -------------------------------------------------------------------------

    async fn cached_portfolio(&self) -> Result<Portfolio, EngineError> {
        self.portfolio_cache
            .get_or_fetch(|| self.engine.get_portfolio())
            .await
    }

    async fn cached_trades(&self, symbol: &str) -> Vec<Trade> {
        let result: Result<Vec<Trade>, EngineError> = self
            .trade_cache
            .get_or_fetch(&symbol.to_string(), || async {
                Ok(self
                    .engine
                    .recent_trades_for_symbol(symbol, STUCK_TRADE_COUNT * 2))
            })
            .await;
        result.unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Scan pass
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "recovery::scan")]
    pub async fn scan_once(&self) {
        if self.breakers.is_open(EXECUTION_BREAKER) {
            debug!("recovery scan skipped — execution breaker open");
            return;
        }

        let portfolio = match self.cached_portfolio().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "recovery scan could not fetch portfolio");
                return;
            }
        };
        if portfolio.positions.is_empty() {
            return;
        }

        let now_millis = chrono::Utc::now().timestamp_millis();
        for position in &portfolio.positions {
            let recent = self.cached_trades(&position.symbol).await;
            let referenced = self.strategies.references(&position.symbol);

            let Some(issue) = classify_position(position, referenced, &recent, now_millis)
            else {
                continue;
            };

            *self.issues_found.lock() += 1;
            self.alert(&issue);

            match issue.action {
                RecoveryAction::Wait => {}
                action => self.queue_action(position.clone(), action, issue.kind),
            }
        }
    }

    /// Alert once per (symbol, reason) per dedup window.
    fn alert(&self, issue: &PositionIssue) {
        let key = (issue.symbol.clone(), issue.kind);
        let mut alerts = self.alerts.lock();
        if let Some(last) = alerts.get(&key) {
            if last.elapsed() < Duration::from_secs(self.cfg.alert_dedup_secs) {
                return;
            }
        }
        alerts.insert(key, Instant::now());

        warn!(
            symbol = %issue.symbol,
            kind = %issue.kind,
            action = ?issue.action,
            priority = ?issue.priority,
            detail = %issue.detail,
            "position issue detected"
        );
        self.bus.publish(
            Channel::Error,
            serde_json::json!({
                "type": "POSITION_ISSUE",
                "symbol": issue.symbol,
                "kind": issue.kind,
                "action": issue.action,
                "priority": issue.priority,
                "detail": issue.detail,
            }),
        );
    }

    fn queue_action(&self, position: Position, action: RecoveryAction, kind: IssueKind) {
        let key = (position.symbol.clone(), position.side);
        {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(key.clone()).or_insert(0);
            if *count >= self.cfg.max_attempts {
                debug!(
                    symbol = %position.symbol,
                    side = %position.side,
                    attempts = *count,
                    "recovery attempt cap reached — not queuing"
                );
                return;
            }
            *count += 1;
        }

        *self.actions_queued.lock() += 1;
        let task = RecoveryTask {
            position,
            action,
            kind,
        };
        match action {
            RecoveryAction::Close => self.close_queue.lock().push(task),
            RecoveryAction::Reduce => self.reduce_queue.lock().push(task),
            RecoveryAction::Wait => {}
        }
    }

    // -------------------------------------------------------------------------
    // Batch flush
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "recovery::flush")]
    pub async fn flush_batches(&self) {
        if self.breakers.is_open(EXECUTION_BREAKER) {
            return;
        }

        let tasks: Vec<RecoveryTask> = {
            let mut close = self.close_queue.lock();
            let mut reduce = self.reduce_queue.lock();
            close.drain(..).chain(reduce.drain(..)).collect()
        };
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "flushing recovery actions");

        let mut set = tokio::task::JoinSet::new();
        for task in tasks {
            let engine = self.engine.clone();
            set.spawn(async move {
                let size = match task.action {
                    RecoveryAction::Close => task.position.size,
                    RecoveryAction::Reduce => task.position.size * REDUCE_FRACTION,
                    RecoveryAction::Wait => return false,
                };
                let signal = Signal::new(
                    STRATEGY_POSITION_RECOVERY,
                    task.position.symbol.clone(),
                    task.position.side.exit_action(),
                    size,
                    task.position.mark_price,
                    1.0,
                    format!("recovery {} for {}", task.kind, task.position.symbol),
                );
                let risk = RiskAssessment {
                    approved: true,
                    suggested_size: size,
                    risk_score: 1.0,
                    warnings: vec!["recovery exit".to_string()],
                    stop_loss: 0.0,
                    take_profit: 0.0,
                    leverage: 1,
                };
                engine.execute_signal(&signal, &risk).await.is_filled()
            });
        }

        let mut executed = 0u64;
        while let Some(result) = set.join_next().await {
            if matches!(result, Ok(true)) {
                executed += 1;
            }
        }
        *self.actions_executed.lock() += executed;
    }

    // -------------------------------------------------------------------------
    // Manual operations
    // -------------------------------------------------------------------------

    /// Operator-triggered recovery for one position.
    pub async fn recover_position(
        &self,
        symbol: &str,
        side: Side,
        action: Option<RecoveryAction>,
    ) -> (bool, String) {
        let portfolio = match self.cached_portfolio().await {
            Ok(p) => p,
            Err(e) => return (false, format!("could not fetch portfolio: {e}")),
        };
        let Some(position) = portfolio
            .positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .cloned()
        else {
            return (false, format!("no {side} position on {symbol}"));
        };

        let action = action.unwrap_or(RecoveryAction::Close);
        self.queue_action(position, action, IssueKind::Orphaned);
        self.flush_batches().await;
        (true, format!("{action:?} queued and flushed for {symbol} {side}"))
    }

    pub fn reset_recovery_attempts(&self, symbol: &str, side: Side) {
        self.attempts
            .lock()
            .remove(&(symbol.to_string(), side));
        info!(symbol, %side, "recovery attempts reset");
    }

    /// Close every open position in parallel. Bypasses the attempt cap.
    pub async fn emergency_close_all(&self) -> usize {
        let portfolio = match self.cached_portfolio().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "emergency close could not fetch portfolio");
                return 0;
            }
        };
        let count = portfolio.positions.len();
        {
            let mut close = self.close_queue.lock();
            for position in portfolio.positions {
                close.push(RecoveryTask {
                    position,
                    action: RecoveryAction::Close,
                    kind: IssueKind::ExcessiveLoss,
                });
            }
        }
        self.flush_batches().await;
        count
    }

    pub fn status(&self) -> RecoveryStatus {
        RecoveryStatus {
            issues_found: *self.issues_found.lock(),
            actions_queued: *self.actions_queued.lock(),
            actions_executed: *self.actions_executed.lock(),
            pending_close: self.close_queue.lock().len(),
            pending_reduce: self.reduce_queue.lock().len(),
            attempts: self
                .attempts
                .lock()
                .iter()
                .map(|((symbol, side), count)| (format!("{symbol}:{side}"), *count))
                .collect(),
        }
    }
}

/// Run the scan and flush loops until shutdown.
pub async fn run_recovery_monitor(
    monitor: Arc<PositionRecoveryMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let scan_every = Duration::from_secs(monitor.cfg.interval_secs);
    let flush_every = Duration::from_millis(monitor.cfg.batch_interval_ms);
    info!(
        scan_secs = scan_every.as_secs(),
        flush_ms = flush_every.as_millis() as u64,
        "position-recovery monitor started"
    );

    let mut scan_tick = interval(scan_every);
    let mut flush_tick = interval(flush_every);

    loop {
        tokio::select! {
            _ = scan_tick.tick() => monitor.scan_once().await,
            _ = flush_tick.tick() => monitor.flush_batches().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("position-recovery monitor stopping");
                    return;
                }
            }
        }
    }
}
