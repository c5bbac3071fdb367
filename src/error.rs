// =============================================================================
// Error taxonomy for the Meridian trading engine
// =============================================================================
//
// Callers of the exchange client and execution engine never see raw transport
// errors: everything is classified into one of these kinds at the boundary,
// and `is_retryable` drives the retry combinator.
// =============================================================================

use crate::types::RejectReason;

/// All failure kinds the engine can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Missing or invalid startup configuration. Fatal when trading is
    /// enabled.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connect, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// A token bucket was starved beyond its configured maximum wait.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Short-circuit from an OPEN circuit breaker.
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    /// A request failed local validation (size, symbol, depth, spread,
    /// cooldown, churn, duplicate).
    #[error("validation failed ({reason}): {message}")]
    Validation {
        reason: RejectReason,
        message: String,
    },

    /// Order size was zero or negative after validation.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// The requested symbol is not present in venue metadata.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// The venue rejected the order for margin reasons.
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    /// Fill rejected by the overfill-protection ledger.
    #[error("overfill rejected: {0}")]
    Overfill(String),

    /// Order response did not indicate fill, resting, or error.
    #[error("unknown order state in venue response")]
    UnknownOrderState,

    /// An exception inside an orchestrator stage.
    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },
}

impl EngineError {
    /// Whether the retry combinator may try the operation again.
    ///
    /// Retryable: network/timeout, HTTP 5xx, rate limits. Everything that
    /// reflects a decision (validation, margin, overfill, breaker) is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }

    /// Classify a venue error string into the non-retryable margin kind when
    /// it carries one of the known keywords.
    pub fn from_venue_error(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("insufficient") || lower.contains("margin") {
            Self::InsufficientMargin(message.to_string())
        } else if lower.contains("rate limit") {
            Self::RateLimit(message.to_string())
        } else {
            Self::Network(message.to_string())
        }
    }

    pub fn validation(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Validation {
            reason,
            message: message.into(),
        }
    }
}
