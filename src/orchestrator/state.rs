// =============================================================================
// Cycle State — the shared object flowing through the trading pipeline
// =============================================================================
//
// Constructed at cycle start, exclusively mutated by stage patches in
// declared order, projected into a TraceSummary and destroyed at cycle end.
// Patches merge last-write-wins on scalars and append-only on thoughts and
// errors; `current_step` only ever moves forward.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market::{Candle, IndicatorSet, Regime};
use crate::types::{Action, Portfolio, RiskAssessment, Signal};

// =============================================================================
// Pipeline steps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CycleStep {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "MARKET_DATA")]
    MarketData,
    #[serde(rename = "PATTERN_RECALL")]
    PatternRecall,
    #[serde(rename = "STRATEGY_IDEATION")]
    StrategyIdeation,
    #[serde(rename = "BACKTESTER")]
    Backtester,
    #[serde(rename = "STRATEGY_SELECTOR")]
    StrategySelector,
    #[serde(rename = "RISK_GATE")]
    RiskGate,
    #[serde(rename = "EXECUTION")]
    Execution,
    #[serde(rename = "LEARNING")]
    Learning,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "SKIPPED_CIRCUIT_BREAKER")]
    SkippedCircuitBreaker,
}

impl std::fmt::Display for CycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::MarketData => "MARKET_DATA",
            Self::PatternRecall => "PATTERN_RECALL",
            Self::StrategyIdeation => "STRATEGY_IDEATION",
            Self::Backtester => "BACKTESTER",
            Self::StrategySelector => "STRATEGY_SELECTOR",
            Self::RiskGate => "RISK_GATE",
            Self::Execution => "EXECUTION",
            Self::Learning => "LEARNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::SkippedCircuitBreaker => "SKIPPED_CIRCUIT_BREAKER",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Stage artifacts
// =============================================================================

/// A recalled historical pattern similar to the current market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: String,
    pub regime: Regime,
    /// Directional bias in [-1, 1]; positive favors longs.
    pub bias: f64,
    pub avg_return: f64,
    pub similarity: f64,
}

/// A candidate strategy produced by the ideation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyIdea {
    pub id: String,
    pub name: String,
    pub action: Action,
    pub confidence: f64,
    pub reason: String,
    /// Stop-loss distance as a fraction of entry.
    pub stop_loss: f64,
    /// Take-profit distance as a fraction of entry.
    pub take_profit: f64,
}

/// Backtest verdict for one idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_id: String,
    pub total_return: f64,
    pub win_rate: f64,
    pub trades: u32,
    pub max_drawdown: f64,
}

/// Terminal status of the execution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "RESTING")]
    Resting,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "FAILED")]
    Failed,
}

/// What the execution stage reported back into the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    pub order_id: Option<u64>,
    pub avg_px: f64,
    pub size: f64,
    pub message: String,
}

// =============================================================================
// CycleState
// =============================================================================

#[derive(Debug, Clone)]
pub struct CycleState {
    // Identity
    pub cycle_id: String,
    pub cycle_start_time: chrono::DateTime<chrono::Utc>,
    pub current_step: CycleStep,

    // Inputs
    pub symbol: String,
    pub timeframe: String,

    // Derived
    pub candles: Vec<Candle>,
    pub indicators: Option<IndicatorSet>,
    pub regime: Option<Regime>,

    // Pattern recall
    pub similar_patterns: Vec<PatternMatch>,
    pub pattern_bias: f64,
    pub pattern_avg_return: f64,

    // Strategy
    pub strategy_ideas: Vec<StrategyIdea>,
    pub backtest_results: Vec<BacktestResult>,
    pub selected_strategy: Option<StrategyIdea>,

    // Decision
    pub signal: Option<Signal>,
    pub risk_assessment: Option<RiskAssessment>,
    pub execution_result: Option<ExecutionRecord>,

    // Control
    pub should_execute: bool,
    pub should_learn: bool,

    // Audit
    pub thoughts: Vec<String>,
    pub errors: Vec<String>,
    pub portfolio: Option<Portfolio>,
}

impl CycleState {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            cycle_start_time: chrono::Utc::now(),
            current_step: CycleStep::Init,
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            candles: Vec::new(),
            indicators: None,
            regime: None,
            similar_patterns: Vec::new(),
            pattern_bias: 0.0,
            pattern_avg_return: 0.0,
            strategy_ideas: Vec::new(),
            backtest_results: Vec::new(),
            selected_strategy: None,
            signal: None,
            risk_assessment: None,
            execution_result: None,
            should_execute: false,
            should_learn: false,
            thoughts: Vec::new(),
            errors: Vec::new(),
            portfolio: None,
        }
    }

    /// Advance the step marker. Steps are monotone: a patch can never move
    /// the cycle backwards, only the terminal markers override.
    pub fn advance_to(&mut self, step: CycleStep) {
        let terminal = matches!(
            step,
            CycleStep::Done | CycleStep::Error | CycleStep::SkippedCircuitBreaker
        );
        if terminal || step > self.current_step {
            self.current_step = step;
        }
    }

    /// Merge a stage's partial output: last-write-wins on scalars, append on
    /// thoughts and errors.
    pub fn apply(&mut self, patch: StagePatch) {
        if let Some(v) = patch.candles {
            self.candles = v;
        }
        if let Some(v) = patch.indicators {
            self.indicators = Some(v);
        }
        if let Some(v) = patch.regime {
            self.regime = Some(v);
        }
        if let Some(v) = patch.similar_patterns {
            self.similar_patterns = v;
        }
        if let Some(v) = patch.pattern_bias {
            self.pattern_bias = v;
        }
        if let Some(v) = patch.pattern_avg_return {
            self.pattern_avg_return = v;
        }
        if let Some(v) = patch.strategy_ideas {
            self.strategy_ideas = v;
        }
        if let Some(v) = patch.backtest_results {
            self.backtest_results = v;
        }
        if let Some(v) = patch.selected_strategy {
            self.selected_strategy = Some(v);
        }
        if let Some(v) = patch.signal {
            self.signal = Some(v);
        }
        if let Some(v) = patch.risk_assessment {
            self.risk_assessment = Some(v);
        }
        if let Some(v) = patch.execution_result {
            // A filled execution always feeds the learner.
            if v.status == ExecutionStatus::Filled {
                self.should_learn = true;
            }
            self.execution_result = Some(v);
        }
        if let Some(v) = patch.should_execute {
            self.should_execute = v;
        }
        if let Some(v) = patch.should_learn {
            self.should_learn = v;
        }
        if let Some(v) = patch.portfolio {
            self.portfolio = Some(v);
        }
        self.thoughts.extend(patch.thoughts);
        self.errors.extend(patch.errors);
    }

    /// Project the compact durable trace written at cycle end.
    pub fn to_trace(&self) -> TraceSummary {
        TraceSummary {
            cycle_id: self.cycle_id.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            cycle_start_time: self.cycle_start_time.to_rfc3339(),
            final_step: self.current_step,
            regime: self.regime,
            strategy_ideas: self.strategy_ideas.clone(),
            backtest_results: self.backtest_results.clone(),
            signal: self.signal.clone(),
            risk_assessment: self.risk_assessment.clone(),
            execution_result: self.execution_result.clone(),
            last_candles: self
                .candles
                .iter()
                .rev()
                .take(20)
                .rev()
                .copied()
                .collect(),
            thoughts: self.thoughts.clone(),
            errors: self.errors.clone(),
        }
    }
}

// =============================================================================
// StagePatch
// =============================================================================

/// Partial cycle state returned by one stage.
#[derive(Debug, Clone, Default)]
pub struct StagePatch {
    pub candles: Option<Vec<Candle>>,
    pub indicators: Option<IndicatorSet>,
    pub regime: Option<Regime>,
    pub similar_patterns: Option<Vec<PatternMatch>>,
    pub pattern_bias: Option<f64>,
    pub pattern_avg_return: Option<f64>,
    pub strategy_ideas: Option<Vec<StrategyIdea>>,
    pub backtest_results: Option<Vec<BacktestResult>>,
    pub selected_strategy: Option<StrategyIdea>,
    pub signal: Option<Signal>,
    pub risk_assessment: Option<RiskAssessment>,
    pub execution_result: Option<ExecutionRecord>,
    pub should_execute: Option<bool>,
    pub should_learn: Option<bool>,
    pub portfolio: Option<Portfolio>,
    pub thoughts: Vec<String>,
    pub errors: Vec<String>,
}

impl StagePatch {
    /// A patch carrying only a thought — the degraded fallback shape.
    pub fn thought(message: impl Into<String>) -> Self {
        Self {
            thoughts: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn with_thought(mut self, message: impl Into<String>) -> Self {
        self.thoughts.push(message.into());
        self
    }
}

// =============================================================================
// TraceSummary
// =============================================================================

/// Compact durable projection of one finished cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub cycle_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub cycle_start_time: String,
    pub final_step: CycleStep,
    pub regime: Option<Regime>,
    pub strategy_ideas: Vec<StrategyIdea>,
    pub backtest_results: Vec<BacktestResult>,
    pub signal: Option<Signal>,
    pub risk_assessment: Option<RiskAssessment>,
    pub execution_result: Option<ExecutionRecord>,
    pub last_candles: Vec<Candle>,
    pub thoughts: Vec<String>,
    pub errors: Vec<String>,
}
