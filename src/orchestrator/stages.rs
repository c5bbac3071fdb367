// =============================================================================
// Stage Plug-ins — seams for the strategy content of the pipeline
// =============================================================================
//
// The pipeline itself is fixed; what varies is pattern recall, ideation,
// backtesting, selection, and risk assessment. Each is a trait with a
// deliberately simple default so the framework runs end-to-end out of the
// box. Swap any of them at startup by handing the orchestrator a different
// `StagePlugins`.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::market::{Candle, Regime};
use crate::orchestrator::state::{BacktestResult, CycleState, PatternMatch, StrategyIdea};
use crate::types::{Action, RiskAssessment};

// =============================================================================
// Traits
// =============================================================================

/// Outcome fed back into the pattern store by the learning stage.
#[derive(Debug, Clone)]
pub struct PatternOutcome {
    pub symbol: String,
    pub regime: Regime,
    pub action: Action,
    /// Fractional return realized (or marked) after the cycle.
    pub realized_return: f64,
}

pub trait PatternStore: Send + Sync {
    fn recall(&self, state: &CycleState) -> Vec<PatternMatch>;
    fn learn(&self, outcome: &PatternOutcome);
}

pub trait StrategyIdeator: Send + Sync {
    fn ideate(&self, state: &CycleState) -> Vec<StrategyIdea>;
}

pub trait Backtester: Send + Sync {
    fn backtest(&self, idea: &StrategyIdea, candles: &[Candle]) -> BacktestResult;
}

pub trait StrategySelector: Send + Sync {
    fn select(&self, state: &CycleState) -> Option<StrategyIdea>;
}

pub trait RiskGate: Send + Sync {
    /// Called only when the cycle carries a signal.
    fn assess(&self, state: &CycleState) -> RiskAssessment;
}

/// The full plug-in set handed to the orchestrator.
pub struct StagePlugins {
    pub patterns: Arc<dyn PatternStore>,
    pub ideator: Arc<dyn StrategyIdeator>,
    pub backtester: Arc<dyn Backtester>,
    pub selector: Arc<dyn StrategySelector>,
    pub risk: Arc<dyn RiskGate>,
}

impl Default for StagePlugins {
    fn default() -> Self {
        Self {
            patterns: Arc::new(InMemoryPatternStore::new()),
            ideator: Arc::new(MomentumIdeator),
            backtester: Arc::new(HorizonBacktester::default()),
            selector: Arc::new(BestReturnSelector),
            risk: Arc::new(DefaultRiskGate::default()),
        }
    }
}

// =============================================================================
// Default pattern store
// =============================================================================

/// Keeps recent cycle outcomes in memory and recalls same-regime history.
pub struct InMemoryPatternStore {
    outcomes: RwLock<Vec<PatternOutcome>>,
}

/// Outcomes retained.
const MAX_OUTCOMES: usize = 500;
/// Matches surfaced per recall.
const MAX_MATCHES: usize = 5;

impl InMemoryPatternStore {
    pub fn new() -> Self {
        Self {
            outcomes: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryPatternStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternStore for InMemoryPatternStore {
    fn recall(&self, state: &CycleState) -> Vec<PatternMatch> {
        let Some(regime) = state.regime else {
            return Vec::new();
        };
        let outcomes = self.outcomes.read();
        outcomes
            .iter()
            .rev()
            .filter(|o| o.regime == regime)
            .take(MAX_MATCHES)
            .enumerate()
            .map(|(rank, o)| PatternMatch {
                id: format!("{}-{}-{rank}", o.symbol, o.regime),
                regime: o.regime,
                bias: match o.action {
                    Action::Buy => o.realized_return.signum(),
                    Action::Sell => -o.realized_return.signum(),
                    Action::Hold => 0.0,
                },
                avg_return: o.realized_return,
                similarity: 1.0 - rank as f64 * 0.1,
            })
            .collect()
    }

    fn learn(&self, outcome: &PatternOutcome) {
        let mut outcomes = self.outcomes.write();
        outcomes.push(outcome.clone());
        let excess = outcomes.len().saturating_sub(MAX_OUTCOMES);
        if excess > 0 {
            outcomes.drain(..excess);
        }
    }
}

// =============================================================================
// Default ideator
// =============================================================================

/// Trend-following in trends, mean-reversion in ranges, flat otherwise.
pub struct MomentumIdeator;

impl StrategyIdeator for MomentumIdeator {
    fn ideate(&self, state: &CycleState) -> Vec<StrategyIdea> {
        let (Some(ind), Some(regime)) = (&state.indicators, state.regime) else {
            return Vec::new();
        };

        // Stop distance keyed to volatility, floored and capped.
        let sl = (ind.atr / ind.last_close * 1.5).clamp(0.005, 0.05);
        let tp = sl * 2.5;
        let trend_confidence = (0.6 + ind.adx / 100.0 + state.pattern_bias * 0.05)
            .clamp(0.0, 0.95);

        let mut ideas = Vec::new();
        match regime {
            Regime::TrendingUp if ind.rsi < 70.0 => ideas.push(StrategyIdea {
                id: "momentum-trend-long".to_string(),
                name: "Trend continuation long".to_string(),
                action: Action::Buy,
                confidence: trend_confidence,
                reason: format!("uptrend adx={:.0} rsi={:.0}", ind.adx, ind.rsi),
                stop_loss: sl,
                take_profit: tp,
            }),
            Regime::TrendingDown if ind.rsi > 30.0 => ideas.push(StrategyIdea {
                id: "momentum-trend-short".to_string(),
                name: "Trend continuation short".to_string(),
                action: Action::Sell,
                confidence: trend_confidence,
                reason: format!("downtrend adx={:.0} rsi={:.0}", ind.adx, ind.rsi),
                stop_loss: sl,
                take_profit: tp,
            }),
            Regime::Ranging => {
                if ind.rsi < 30.0 {
                    ideas.push(StrategyIdea {
                        id: "reversion-long".to_string(),
                        name: "Range reversion long".to_string(),
                        action: Action::Buy,
                        confidence: 0.82,
                        reason: format!("oversold rsi={:.0} in range", ind.rsi),
                        stop_loss: sl,
                        take_profit: sl * 1.5,
                    });
                } else if ind.rsi > 70.0 {
                    ideas.push(StrategyIdea {
                        id: "reversion-short".to_string(),
                        name: "Range reversion short".to_string(),
                        action: Action::Sell,
                        confidence: 0.82,
                        reason: format!("overbought rsi={:.0} in range", ind.rsi),
                        stop_loss: sl,
                        take_profit: sl * 1.5,
                    });
                }
            }
            // Volatile and unknown regimes trade nothing.
            _ => {}
        }
        ideas
    }
}

// =============================================================================
// Default backtester
// =============================================================================

/// Replays entries along the candle window with a fixed exit horizon.
pub struct HorizonBacktester {
    /// Bars between simulated entries.
    pub stride: usize,
    /// Bars an entry is held before a flat exit.
    pub horizon: usize,
}

impl Default for HorizonBacktester {
    fn default() -> Self {
        Self {
            stride: 5,
            horizon: 10,
        }
    }
}

impl Backtester for HorizonBacktester {
    fn backtest(&self, idea: &StrategyIdea, candles: &[Candle]) -> BacktestResult {
        let direction = match idea.action {
            Action::Buy => 1.0,
            Action::Sell => -1.0,
            Action::Hold => 0.0,
        };

        let mut returns = Vec::new();
        let mut i = 0;
        while i + self.horizon < candles.len() {
            let entry = candles[i].close;
            if entry <= 0.0 || direction == 0.0 {
                i += self.stride;
                continue;
            }

            // Walk forward until a level is crossed or the horizon expires.
            let mut trade_return = None;
            for bar in &candles[i + 1..=i + self.horizon] {
                let best = if direction > 0.0 { bar.high } else { bar.low };
                let worst = if direction > 0.0 { bar.low } else { bar.high };
                let favorable = direction * (best - entry) / entry;
                let adverse = direction * (worst - entry) / entry;
                if adverse <= -idea.stop_loss {
                    trade_return = Some(-idea.stop_loss);
                    break;
                }
                if favorable >= idea.take_profit {
                    trade_return = Some(idea.take_profit);
                    break;
                }
            }
            let exit = candles[i + self.horizon].close;
            returns.push(trade_return.unwrap_or(direction * (exit - entry) / entry));
            i += self.stride;
        }

        let trades = returns.len() as u32;
        let total_return: f64 = returns.iter().sum();
        let wins = returns.iter().filter(|r| **r > 0.0).count();
        let win_rate = if trades > 0 {
            wins as f64 / trades as f64
        } else {
            0.0
        };

        // Max drawdown along the cumulative curve.
        let mut peak = 0.0f64;
        let mut max_drawdown = 0.0f64;
        let mut cumulative = 0.0f64;
        for r in &returns {
            cumulative += r;
            peak = peak.max(cumulative);
            max_drawdown = max_drawdown.max(peak - cumulative);
        }

        BacktestResult {
            strategy_id: idea.id.clone(),
            total_return,
            win_rate,
            trades,
            max_drawdown,
        }
    }
}

// =============================================================================
// Default selector
// =============================================================================

/// Highest positive backtest return with a survivable win rate.
pub struct BestReturnSelector;

/// Minimum acceptable win rate.
const MIN_WIN_RATE: f64 = 0.4;

impl StrategySelector for BestReturnSelector {
    fn select(&self, state: &CycleState) -> Option<StrategyIdea> {
        let best = state
            .backtest_results
            .iter()
            .filter(|r| r.trades > 0 && r.total_return > 0.0 && r.win_rate >= MIN_WIN_RATE)
            .max_by(|a, b| a.total_return.total_cmp(&b.total_return))?;
        state
            .strategy_ideas
            .iter()
            .find(|i| i.id == best.strategy_id)
            .cloned()
    }
}

// =============================================================================
// Default risk gate
// =============================================================================

pub struct DefaultRiskGate {
    /// Fraction of account value one position may consume.
    pub max_position_fraction: f64,
    pub max_leverage: u32,
}

impl Default for DefaultRiskGate {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.05,
            max_leverage: 5,
        }
    }
}

impl RiskGate for DefaultRiskGate {
    fn assess(&self, state: &CycleState) -> RiskAssessment {
        let mut warnings = Vec::new();
        let mut approved = true;

        let signal = state.signal.as_ref();
        let idea = state.selected_strategy.as_ref();
        let price = signal.map(|s| s.price).unwrap_or(0.0);

        if price <= 0.0 {
            approved = false;
            warnings.push("signal has no usable price".to_string());
        }

        // No pyramiding: an existing position on the symbol blocks a fresh
        // same-direction entry.
        if let (Some(signal), Some(portfolio)) = (signal, state.portfolio.as_ref()) {
            if let Some(position) = portfolio.position(&signal.symbol) {
                if signal.action == position.side.entry_action() {
                    approved = false;
                    warnings.push(format!(
                        "{} position already open on {}",
                        position.side, signal.symbol
                    ));
                }
            }
        }

        let account_value = state
            .portfolio
            .as_ref()
            .map(|p| p.account_value)
            .unwrap_or(0.0);
        let suggested_size = if price > 0.0 && account_value > 0.0 {
            account_value * self.max_position_fraction / price
        } else {
            0.0
        };
        if suggested_size <= 0.0 {
            approved = false;
            warnings.push("no capital available for sizing".to_string());
        }

        let stop_loss = idea.map(|i| i.stop_loss).unwrap_or(0.02);
        let take_profit = idea.map(|i| i.take_profit).unwrap_or(0.04);
        let confidence = signal.map(|s| s.confidence).unwrap_or(0.0);

        RiskAssessment {
            approved,
            suggested_size,
            risk_score: (1.0 - confidence).clamp(0.0, 1.0),
            warnings,
            stop_loss,
            take_profit,
            leverage: self.max_leverage,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::IndicatorSet;
    use crate::types::{Portfolio, Position, Side, Signal};

    fn trending_state() -> CycleState {
        let mut state = CycleState::new("BTC", "1h");
        state.indicators = Some(IndicatorSet {
            ema_fast: 51_000.0,
            ema_slow: 50_000.0,
            rsi: 60.0,
            atr: 500.0,
            bollinger_width: 2.0,
            adx: 30.0,
            last_close: 51_000.0,
        });
        state.regime = Some(Regime::TrendingUp);
        state
    }

    #[test]
    fn ideator_goes_long_in_uptrend() {
        let ideas = MomentumIdeator.ideate(&trending_state());
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].action, Action::Buy);
        assert!(ideas[0].confidence > 0.8);
        assert!(ideas[0].stop_loss > 0.0);
        assert!(ideas[0].take_profit > ideas[0].stop_loss);
    }

    #[test]
    fn ideator_flat_in_volatile_regime() {
        let mut state = trending_state();
        state.regime = Some(Regime::Volatile);
        assert!(MomentumIdeator.ideate(&state).is_empty());
    }

    #[test]
    fn ideator_reverts_in_oversold_range() {
        let mut state = trending_state();
        state.regime = Some(Regime::Ranging);
        state.indicators.as_mut().unwrap().rsi = 25.0;
        let ideas = MomentumIdeator.ideate(&state);
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].action, Action::Buy);
    }

    #[test]
    fn backtester_profits_on_a_clean_uptrend() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 + i as f64;
                Candle::new(i, base, base + 1.2, base - 0.3, base + 1.0, 10.0)
            })
            .collect();
        let idea = StrategyIdea {
            id: "long".to_string(),
            name: "long".to_string(),
            action: Action::Buy,
            confidence: 0.9,
            reason: "test".to_string(),
            stop_loss: 0.02,
            take_profit: 0.04,
        };
        let result = HorizonBacktester::default().backtest(&idea, &candles);
        assert!(result.trades > 0);
        assert!(result.total_return > 0.0);
        assert!(result.win_rate > 0.5);
    }

    #[test]
    fn backtester_empty_window_is_flat() {
        let idea = StrategyIdea {
            id: "x".to_string(),
            name: "x".to_string(),
            action: Action::Buy,
            confidence: 0.9,
            reason: "test".to_string(),
            stop_loss: 0.02,
            take_profit: 0.04,
        };
        let result = HorizonBacktester::default().backtest(&idea, &[]);
        assert_eq!(result.trades, 0);
        assert_eq!(result.total_return, 0.0);
    }

    #[test]
    fn selector_picks_best_positive_return() {
        let mut state = CycleState::new("BTC", "1h");
        state.strategy_ideas = vec![
            StrategyIdea {
                id: "a".to_string(),
                name: "a".to_string(),
                action: Action::Buy,
                confidence: 0.9,
                reason: "a".to_string(),
                stop_loss: 0.02,
                take_profit: 0.04,
            },
            StrategyIdea {
                id: "b".to_string(),
                name: "b".to_string(),
                action: Action::Sell,
                confidence: 0.9,
                reason: "b".to_string(),
                stop_loss: 0.02,
                take_profit: 0.04,
            },
        ];
        state.backtest_results = vec![
            BacktestResult {
                strategy_id: "a".to_string(),
                total_return: 0.05,
                win_rate: 0.6,
                trades: 10,
                max_drawdown: 0.02,
            },
            BacktestResult {
                strategy_id: "b".to_string(),
                total_return: 0.12,
                win_rate: 0.55,
                trades: 10,
                max_drawdown: 0.03,
            },
        ];
        let selected = BestReturnSelector.select(&state).unwrap();
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn selector_rejects_losing_and_low_win_rate() {
        let mut state = CycleState::new("BTC", "1h");
        state.strategy_ideas = vec![StrategyIdea {
            id: "a".to_string(),
            name: "a".to_string(),
            action: Action::Buy,
            confidence: 0.9,
            reason: "a".to_string(),
            stop_loss: 0.02,
            take_profit: 0.04,
        }];
        state.backtest_results = vec![BacktestResult {
            strategy_id: "a".to_string(),
            total_return: 0.2,
            win_rate: 0.2,
            trades: 10,
            max_drawdown: 0.1,
        }];
        assert!(BestReturnSelector.select(&state).is_none());
    }

    #[test]
    fn risk_gate_blocks_pyramiding() {
        let mut state = trending_state();
        state.signal = Some(Signal::new(
            "momentum-trend-long",
            "BTC",
            Action::Buy,
            0.0,
            51_000.0,
            0.9,
            "uptrend",
        ));
        state.portfolio = Some(Portfolio {
            account_value: 10_000.0,
            total_margin_used: 500.0,
            withdrawable: 9_500.0,
            positions: vec![Position {
                symbol: "BTC".to_string(),
                side: Side::Long,
                size: 0.01,
                entry_price: 50_000.0,
                mark_price: 51_000.0,
                unrealized_pnl: 10.0,
                leverage: 5,
                margin_used: 100.0,
            }],
        });

        let assessment = DefaultRiskGate::default().assess(&state);
        assert!(!assessment.approved);
        assert!(!assessment.warnings.is_empty());
    }

    #[test]
    fn risk_gate_sizes_from_account_value() {
        let mut state = trending_state();
        state.signal = Some(Signal::new(
            "momentum-trend-long",
            "BTC",
            Action::Buy,
            0.0,
            50_000.0,
            0.9,
            "uptrend",
        ));
        state.portfolio = Some(Portfolio {
            account_value: 10_000.0,
            total_margin_used: 0.0,
            withdrawable: 10_000.0,
            positions: vec![],
        });

        let assessment = DefaultRiskGate::default().assess(&state);
        assert!(assessment.approved);
        // 5 % of 10k at 50k/coin = 0.01.
        assert!((assessment.suggested_size - 0.01).abs() < 1e-9);
        assert!(assessment.stop_loss > 0.0);
    }

    #[test]
    fn pattern_store_learns_and_recalls_by_regime() {
        let store = InMemoryPatternStore::new();
        store.learn(&PatternOutcome {
            symbol: "BTC".to_string(),
            regime: Regime::TrendingUp,
            action: Action::Buy,
            realized_return: 0.03,
        });
        store.learn(&PatternOutcome {
            symbol: "ETH".to_string(),
            regime: Regime::Ranging,
            action: Action::Sell,
            realized_return: -0.01,
        });

        let mut state = CycleState::new("BTC", "1h");
        state.regime = Some(Regime::TrendingUp);
        let matches = store.recall(&state);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].regime, Regime::TrendingUp);
        assert!(matches[0].bias > 0.0);

        state.regime = None;
        assert!(store.recall(&state).is_empty());
    }
}
