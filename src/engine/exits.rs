// =============================================================================
// Managed-Exit Monitor — internal stop-loss / take-profit enforcement
// =============================================================================
//
// Runs as a background task while at least one plan exists, waking every
// 5 seconds to:
//   1. Fetch the current portfolio.
//   2. Drop plans whose position vanished or flipped side.
//   3. Evaluate each remaining plan against the mark price.
//   4. Synthesize a reduce-only exit signal when a level triggers.
//
// The stop-loss fires slightly early (x0.9 on the level, floored at 0.1 %)
// to absorb exit latency; the take-profit fires slightly late (x1.15) so the
// realized reward/risk stays above the planned one. A per-symbol in-flight
// guard keeps concurrent ticks from double-firing one symbol.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::engine::{ExecutionEngine, ManagedExitPlan, STRATEGY_RISK_MANAGED_EXIT};
use crate::types::{Position, RiskAssessment, Side, Signal};

/// Take-profit trigger multiplier on the planned level.
pub const TP_TRIGGER_MULT: f64 = 1.15;
/// Stop-loss trigger multiplier (early).
pub const SL_EARLY_MULT: f64 = 0.9;
/// Floor on the stop-loss trigger distance.
pub const SL_MIN_TRIGGER: f64 = 0.001;

/// Which level fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop-loss"),
            Self::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// Signed PnL fraction of a position relative to the plan's entry price.
pub fn pnl_fraction(plan: &ManagedExitPlan, mark_price: f64) -> f64 {
    if plan.entry_price <= 0.0 {
        return 0.0;
    }
    let raw = (mark_price - plan.entry_price) / plan.entry_price;
    match plan.side {
        Side::Long => raw,
        Side::Short => -raw,
    }
}

/// Evaluate a plan against the mark price.
pub fn evaluate_plan(plan: &ManagedExitPlan, mark_price: f64) -> Option<ExitTrigger> {
    let pnl = pnl_fraction(plan, mark_price);

    let sl_trigger = -(SL_MIN_TRIGGER.max(plan.stop_loss_pct * SL_EARLY_MULT));
    if plan.stop_loss_pct > 0.0 && pnl <= sl_trigger {
        return Some(ExitTrigger::StopLoss);
    }

    let tp_trigger = plan.take_profit_pct * TP_TRIGGER_MULT;
    if plan.take_profit_pct > 0.0 && pnl >= tp_trigger {
        return Some(ExitTrigger::TakeProfit);
    }

    None
}

/// Build the reduce-only exit signal fired on a trigger.
fn exit_signal(plan: &ManagedExitPlan, position: &Position, trigger: ExitTrigger) -> Signal {
    Signal::new(
        STRATEGY_RISK_MANAGED_EXIT,
        plan.symbol.clone(),
        plan.side.exit_action(),
        position.size,
        position.mark_price,
        1.0,
        format!("managed {trigger} exit from entry {}", plan.entry_price),
    )
}

fn exit_risk(size: f64) -> RiskAssessment {
    RiskAssessment {
        approved: true,
        suggested_size: size,
        risk_score: 0.0,
        warnings: vec!["managed exit".to_string()],
        stop_loss: 0.0,
        take_profit: 0.0,
        leverage: 1,
    }
}

/// Run the monitor until shutdown is signalled.
pub async fn run_managed_exit_monitor(
    engine: Arc<ExecutionEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tick = engine.exit_monitor_interval();
    info!(interval_secs = tick.as_secs(), "managed-exit monitor started");
    let mut ticker = interval(tick);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("managed-exit monitor stopping");
                    return;
                }
            }
        }

        if !engine.has_exit_plans() {
            continue;
        }

        let portfolio = match engine.get_portfolio().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "exit monitor could not fetch portfolio");
                continue;
            }
        };

        for plan in engine.exit_plans() {
            let Some(position) = portfolio.position(&plan.symbol).cloned() else {
                // Position vanished (external close, liquidation): abandon.
                engine.drop_exit_plan(&plan.symbol);
                continue;
            };
            if position.side != plan.side {
                engine.drop_exit_plan(&plan.symbol);
                continue;
            }

            let Some(trigger) = evaluate_plan(&plan, position.mark_price) else {
                debug!(
                    symbol = %plan.symbol,
                    mark = position.mark_price,
                    pnl_pct = pnl_fraction(&plan, position.mark_price) * 100.0,
                    "no exit trigger"
                );
                continue;
            };

            if !engine.try_begin_managed_exit(&plan.symbol) {
                debug!(symbol = %plan.symbol, "exit already in flight");
                continue;
            }

            info!(
                symbol = %plan.symbol,
                %trigger,
                entry = plan.entry_price,
                mark = position.mark_price,
                pnl_pct = pnl_fraction(&plan, position.mark_price) * 100.0,
                "managed exit triggered"
            );

            let signal = exit_signal(&plan, &position, trigger);
            let risk = exit_risk(position.size);
            let outcome = engine.execute_signal(&signal, &risk).await;
            if !outcome.is_filled() {
                warn!(symbol = %plan.symbol, outcome = %outcome, "managed exit did not fill");
            }
            engine.finish_managed_exit(&plan.symbol);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn plan(side: Side, entry: f64, sl: f64, tp: f64) -> ManagedExitPlan {
        ManagedExitPlan {
            symbol: "BTC".to_string(),
            side,
            entry_price: entry,
            stop_loss_pct: sl,
            take_profit_pct: tp,
            created_at: 0,
        }
    }

    #[test]
    fn take_profit_waits_for_padded_level() {
        // Entry 50005, tp 5 %: trigger at 5.75 %.
        let p = plan(Side::Long, 50_005.0, 0.02, 0.05);

        // +5.01 % — planned level reached but padded trigger not yet.
        assert_eq!(evaluate_plan(&p, 52_510.0), None);

        // +5.75 % — fires.
        assert_eq!(evaluate_plan(&p, 52_881.0), Some(ExitTrigger::TakeProfit));
    }

    #[test]
    fn stop_loss_fires_early() {
        // sl 2 %: trigger at -1.8 %.
        let p = plan(Side::Long, 50_000.0, 0.02, 0.05);
        assert_eq!(evaluate_plan(&p, 49_150.0), None); // -1.7 %
        assert_eq!(evaluate_plan(&p, 49_100.0), Some(ExitTrigger::StopLoss)); // -1.8 %
    }

    #[test]
    fn tight_stop_floored_at_min_trigger() {
        // sl 0.05 %: x0.9 would be 0.045 %, floored to 0.1 %.
        let p = plan(Side::Long, 10_000.0, 0.0005, 0.05);
        assert_eq!(evaluate_plan(&p, 9_994.0), None); // -0.06 %
        assert_eq!(evaluate_plan(&p, 9_990.0), Some(ExitTrigger::StopLoss)); // -0.1 %
    }

    #[test]
    fn short_side_pnl_is_inverted() {
        let p = plan(Side::Short, 3_000.0, 0.02, 0.05);

        // Price fell 6 %: a short is up 6 % >= 5.75 % trigger.
        assert_eq!(evaluate_plan(&p, 2_820.0), Some(ExitTrigger::TakeProfit));

        // Price rose 1.9 %: short is down 1.9 % <= -1.8 % trigger.
        assert_eq!(evaluate_plan(&p, 3_057.0), Some(ExitTrigger::StopLoss));
    }

    #[test]
    fn zero_levels_never_trigger() {
        let p = plan(Side::Long, 50_000.0, 0.0, 0.0);
        assert_eq!(evaluate_plan(&p, 1.0), None);
        assert_eq!(evaluate_plan(&p, 1_000_000.0), None);
    }

    #[test]
    fn exit_signal_is_reduce_direction() {
        let p = plan(Side::Long, 50_005.0, 0.02, 0.05);
        let position = Position {
            symbol: "BTC".to_string(),
            side: Side::Long,
            size: 0.01,
            entry_price: 50_005.0,
            mark_price: 52_881.0,
            unrealized_pnl: 28.76,
            leverage: 5,
            margin_used: 100.0,
        };
        let signal = exit_signal(&p, &position, ExitTrigger::TakeProfit);
        assert_eq!(signal.action, crate::types::Action::Sell);
        assert_eq!(signal.strategy_id, STRATEGY_RISK_MANAGED_EXIT);
        assert_eq!(signal.size, 0.01);
        assert!((signal.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn synthesized_risk_is_exit_intent() {
        assert!(exit_risk(0.01).is_exit_intent());
    }
}
