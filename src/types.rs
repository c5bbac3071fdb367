// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// The order action that opens a position on this side.
    pub fn entry_action(self) -> Action {
        match self {
            Self::Long => Action::Buy,
            Self::Short => Action::Sell,
        }
    }

    /// The order action that closes a position on this side.
    pub fn exit_action(self) -> Action {
        match self {
            Self::Long => Action::Sell,
            Self::Short => Action::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Order action carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "HOLD")]
    Hold,
}

impl Action {
    /// The position side an entry with this action would open.
    pub fn opens(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Long),
            Self::Sell => Some(Side::Short),
            Self::Hold => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// How an order should be priced at the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// A trading signal produced by the strategy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// Strategy that produced the signal.
    pub strategy_id: String,
    pub symbol: String,
    pub action: Action,
    /// Requested size in base units; must be >= 0.
    pub size: f64,
    /// Reference price; must be >= 0. Ignored for market orders.
    pub price: f64,
    pub order_type: OrderType,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    pub reason: String,
    /// Unix millis.
    pub timestamp: i64,
}

impl Signal {
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        action: Action,
        size: f64,
        price: f64,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            action,
            size,
            price,
            order_type: OrderType::Market,
            confidence,
            reason: reason.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Verdict of the risk gate for a single signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub approved: bool,
    /// Size the risk gate is willing to trade (may shrink the signal's size).
    pub suggested_size: f64,
    /// 0 = no risk, 1 = maximum risk.
    pub risk_score: f64,
    pub warnings: Vec<String>,
    /// Stop-loss distance as a fraction of entry price (0.02 = 2 %).
    pub stop_loss: f64,
    /// Take-profit distance as a fraction of entry price.
    pub take_profit: f64,
    pub leverage: u32,
}

impl RiskAssessment {
    /// An exit intent is encoded by zeroed stop/take levels or an explicit
    /// "exit" warning.
    pub fn is_exit_intent(&self) -> bool {
        (self.stop_loss == 0.0 && self.take_profit == 0.0)
            || self
                .warnings
                .iter()
                .any(|w| w.to_ascii_lowercase().contains("exit"))
    }
}

/// Final status of a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

/// Whether a trade opened or closed exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryExit {
    #[serde(rename = "ENTRY")]
    Entry,
    #[serde(rename = "EXIT")]
    Exit,
}

/// A persisted trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Action,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    /// Realized PnL; 0 for entries.
    pub pnl: f64,
    /// Unix millis.
    pub timestamp: i64,
    pub order_type: OrderType,
    pub status: TradeStatus,
    pub entry_exit: EntryExit,
}

/// A live position as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Always > 0; direction is carried by `side`.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin_used: f64,
}

impl Position {
    /// Notional value at entry.
    pub fn entry_notional(&self) -> f64 {
        self.size * self.entry_price
    }
}

/// Account-level snapshot combining venue state with the local trade log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Portfolio {
    pub account_value: f64,
    pub total_margin_used: f64,
    pub withdrawable: f64,
    pub positions: Vec<Position>,
}

impl Portfolio {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }
}

/// Closed set of reasons an order or signal can be turned away without an
/// error having occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "HOLD_SIGNAL")]
    HoldSignal,
    #[serde(rename = "BELOW_MIN_CONFIDENCE")]
    BelowMinConfidence,
    #[serde(rename = "DUPLICATE_SIGNAL")]
    DuplicateSignal,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "COOLDOWN")]
    Cooldown,
    #[serde(rename = "MIN_INTERVAL")]
    MinInterval,
    #[serde(rename = "CHURN_PREVENTION")]
    ChurnPrevention,
    #[serde(rename = "INVALID_SIZE")]
    InvalidSize,
    #[serde(rename = "INSUFFICIENT_DEPTH")]
    InsufficientDepth,
    #[serde(rename = "SPREAD_TOO_WIDE")]
    SpreadTooWide,
    #[serde(rename = "SAFETY_MULTIPLIER_ZERO")]
    SafetyMultiplierZero,
    #[serde(rename = "NO_POSITION_TO_CLOSE")]
    NoPositionToClose,
    #[serde(rename = "EMERGENCY_STOP")]
    EmergencyStop,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HoldSignal => "HOLD_SIGNAL",
            Self::BelowMinConfidence => "BELOW_MIN_CONFIDENCE",
            Self::DuplicateSignal => "DUPLICATE_SIGNAL",
            Self::RateLimited => "RATE_LIMITED",
            Self::Cooldown => "COOLDOWN",
            Self::MinInterval => "MIN_INTERVAL",
            Self::ChurnPrevention => "CHURN_PREVENTION",
            Self::InvalidSize => "INVALID_SIZE",
            Self::InsufficientDepth => "INSUFFICIENT_DEPTH",
            Self::SpreadTooWide => "SPREAD_TOO_WIDE",
            Self::SafetyMultiplierZero => "SAFETY_MULTIPLIER_ZERO",
            Self::NoPositionToClose => "NO_POSITION_TO_CLOSE",
            Self::EmergencyStop => "EMERGENCY_STOP",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_actions_are_inverse() {
        assert_eq!(Side::Long.entry_action(), Action::Buy);
        assert_eq!(Side::Long.exit_action(), Action::Sell);
        assert_eq!(Side::Short.entry_action(), Action::Sell);
        assert_eq!(Side::Short.exit_action(), Action::Buy);
    }

    #[test]
    fn exit_intent_from_zeroed_levels() {
        let risk = RiskAssessment {
            approved: true,
            suggested_size: 1.0,
            risk_score: 0.1,
            warnings: vec![],
            stop_loss: 0.0,
            take_profit: 0.0,
            leverage: 1,
        };
        assert!(risk.is_exit_intent());
    }

    #[test]
    fn exit_intent_from_warning() {
        let risk = RiskAssessment {
            approved: true,
            suggested_size: 1.0,
            risk_score: 0.1,
            warnings: vec!["forced exit: excessive loss".to_string()],
            stop_loss: 0.02,
            take_profit: 0.05,
            leverage: 1,
        };
        assert!(risk.is_exit_intent());
    }

    #[test]
    fn entry_levels_are_not_exit_intent() {
        let risk = RiskAssessment {
            approved: true,
            suggested_size: 1.0,
            risk_score: 0.1,
            warnings: vec!["size reduced".to_string()],
            stop_loss: 0.02,
            take_profit: 0.05,
            leverage: 1,
        };
        assert!(!risk.is_exit_intent());
    }

    #[test]
    fn serde_enum_wire_names() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"LONG\"");
        assert_eq!(serde_json::to_string(&Action::Buy).unwrap(), "\"BUY\"");
        assert_eq!(
            serde_json::to_string(&RejectReason::ChurnPrevention).unwrap(),
            "\"CHURN_PREVENTION\""
        );
    }
}
