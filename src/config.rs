// =============================================================================
// Engine Configuration — environment-driven, snapshotted once at startup
// =============================================================================
//
// Every tunable lives here. Values come from the process environment (with
// `.env` support); the snapshot is immutable for the lifetime of the process
// and shared through the dependency graph. All fields carry serde defaults so
// the config can also round-trip through the API as JSON.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_dashboard_port() -> u16 {
    3001
}

fn default_poll_ms() -> u64 {
    10_000
}

fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]
}

fn default_timeframes() -> Vec<String> {
    vec!["1h".to_string()]
}

fn default_cycle_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> String {
    "data".to_string()
}

// -- churn defaults ----------------------------------------------------------

fn default_min_order_interval_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_extended_cooldown_secs() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_min_confidence() -> f64 {
    0.80
}

fn default_critical_fill_rate() -> f64 {
    0.05
}

fn default_fill_rate_warmup() -> u32 {
    5
}

// -- engine defaults ---------------------------------------------------------

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_max_signals_per_minute() -> u32 {
    3
}

fn default_dup_price_tolerance() -> f64 {
    0.005
}

fn default_dup_confidence_tolerance() -> f64 {
    0.1
}

fn default_exit_monitor_interval_secs() -> u64 {
    5
}

// -- exchange defaults -------------------------------------------------------

fn default_slippage() -> f64 {
    0.005
}

fn default_max_spread() -> f64 {
    0.001
}

fn default_min_depth_notional() -> f64 {
    10_000.0
}

fn default_depth_levels() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_stale_order_cancel_secs() -> u64 {
    60
}

fn default_stale_order_warn_secs() -> u64 {
    30
}

fn default_exit_order_max_attempts() -> u32 {
    3
}

fn default_backoff_cap_secs() -> u64 {
    30
}

// -- recovery defaults -------------------------------------------------------

fn default_recovery_interval_secs() -> u64 {
    30
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_batch_interval_ms() -> u64 {
    2_000
}

fn default_alert_dedup_secs() -> u64 {
    300
}

// -- breaker defaults --------------------------------------------------------

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_open_ms() -> u64 {
    60_000
}

fn default_half_open_probes() -> u32 {
    1
}

fn default_max_consecutive_cycle_errors() -> u32 {
    5
}

// =============================================================================
// Sub-configs
// =============================================================================

/// Per-symbol churn-guard constants used by the exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnConfig {
    /// Hard minimum between any two entry orders on a symbol.
    #[serde(default = "default_min_order_interval_secs")]
    pub min_order_interval_secs: u64,

    /// Standard cooldown between entries.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Extended-cooldown unit (capped at five minutes), doubled per
    /// consecutive failure past the threshold.
    #[serde(default = "default_extended_cooldown_secs")]
    pub extended_cooldown_secs: u64,

    /// Consecutive failures at which the cooldown starts doubling.
    #[serde(default = "default_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Minimum signal confidence accepted for entries.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Fill rate below which a symbol is shut off.
    #[serde(default = "default_critical_fill_rate")]
    pub critical_fill_rate: f64,

    /// Submissions before the fill-rate gate activates.
    #[serde(default = "default_fill_rate_warmup")]
    pub fill_rate_warmup: u32,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            min_order_interval_secs: default_min_order_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            extended_cooldown_secs: default_extended_cooldown_secs(),
            consecutive_failure_threshold: default_failure_threshold(),
            min_confidence: default_min_confidence(),
            critical_fill_rate: default_critical_fill_rate(),
            fill_rate_warmup: default_fill_rate_warmup(),
        }
    }
}

/// Signal-admission constants used by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Window within which two similar signals are duplicates.
    #[serde(default = "default_dedup_window_secs")]
    pub signal_dedup_window_secs: u64,

    /// Rolling 60 s per-symbol signal cap.
    #[serde(default = "default_max_signals_per_minute")]
    pub max_signals_per_minute: u32,

    /// Price move below which two signals count as the same price.
    #[serde(default = "default_dup_price_tolerance")]
    pub dup_price_tolerance: f64,

    /// Confidence delta below which two signals count as the same confidence.
    #[serde(default = "default_dup_confidence_tolerance")]
    pub dup_confidence_tolerance: f64,

    /// Managed-exit monitor tick.
    #[serde(default = "default_exit_monitor_interval_secs")]
    pub exit_monitor_interval_secs: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            signal_dedup_window_secs: default_dedup_window_secs(),
            max_signals_per_minute: default_max_signals_per_minute(),
            dup_price_tolerance: default_dup_price_tolerance(),
            dup_confidence_tolerance: default_dup_confidence_tolerance(),
            exit_monitor_interval_secs: default_exit_monitor_interval_secs(),
        }
    }
}

/// Wire-level constants for the exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Slippage buffer added per side to market-like orders.
    #[serde(default = "default_slippage")]
    pub slippage: f64,

    /// Maximum allowed (ask - bid) / mid; at or above rejects.
    #[serde(default = "default_max_spread")]
    pub max_spread: f64,

    /// Minimum notional depth across the top levels of each side.
    #[serde(default = "default_min_depth_notional")]
    pub min_depth_notional: f64,

    /// Book levels required per side for depth validation.
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Age at which a resting order is cancelled by the watchdog.
    #[serde(default = "default_stale_order_cancel_secs")]
    pub stale_order_cancel_secs: u64,

    /// Age at which a resting order is logged as stale.
    #[serde(default = "default_stale_order_warn_secs")]
    pub stale_order_warn_secs: u64,

    /// Attempts for reduce-only exits; entries always use one.
    #[serde(default = "default_exit_order_max_attempts")]
    pub exit_order_max_attempts: u32,

    /// Cap on the exponential inter-attempt backoff.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            slippage: default_slippage(),
            max_spread: default_max_spread(),
            min_depth_notional: default_min_depth_notional(),
            depth_levels: default_depth_levels(),
            request_timeout_secs: default_request_timeout_secs(),
            stale_order_cancel_secs: default_stale_order_cancel_secs(),
            stale_order_warn_secs: default_stale_order_warn_secs(),
            exit_order_max_attempts: default_exit_order_max_attempts(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Position-recovery monitor constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_interval_secs")]
    pub interval_secs: u64,

    /// Per `(symbol, side)` recovery attempt cap.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_attempts: u32,

    /// Batch-buffer flush cadence.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Alert dedup window per `(symbol, reason)`.
    #[serde(default = "default_alert_dedup_secs")]
    pub alert_dedup_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recovery_interval_secs(),
            max_attempts: default_max_recovery_attempts(),
            batch_interval_ms: default_batch_interval_ms(),
            alert_dedup_secs: default_alert_dedup_secs(),
        }
    }
}

/// Circuit-breaker policy defaults plus the orchestrator's error budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_breaker_open_ms")]
    pub open_ms: u64,

    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,

    /// Consecutive cycle errors that force the `execution` breaker open.
    #[serde(default = "default_max_consecutive_cycle_errors")]
    pub max_consecutive_cycle_errors: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            open_ms: default_breaker_open_ms(),
            half_open_probes: default_half_open_probes(),
            max_consecutive_cycle_errors: default_max_consecutive_cycle_errors(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Immutable configuration snapshot taken once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    #[serde(default = "default_poll_ms")]
    pub news_dashboard_poll_ms: u64,

    /// Venue signing key. Required when trading is enabled; never logged.
    #[serde(skip_serializing, default)]
    pub private_key: Option<String>,

    /// Operator main address reported to the venue.
    #[serde(default)]
    pub main_address: Option<String>,

    /// Testnet vs live venue endpoints.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Whether signals may reach the venue at all.
    #[serde(default)]
    pub trading_enabled: bool,

    /// Operator token required on mutating API endpoints (absent = open).
    #[serde(skip_serializing, default)]
    pub api_token: Option<String>,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    /// Tick cadence of each `(symbol, timeframe)` cycle worker.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Directory for trace/trade JSONL output.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub churn: ChurnConfig,

    #[serde(default)]
    pub engine: EngineLimits,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dashboard_port: default_dashboard_port(),
            news_dashboard_poll_ms: default_poll_ms(),
            private_key: None,
            main_address: None,
            testnet: true,
            trading_enabled: false,
            api_token: None,
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            cycle_interval_secs: default_cycle_interval_secs(),
            data_dir: default_data_dir(),
            churn: ChurnConfig::default(),
            engine: EngineLimits::default(),
            exchange: ExchangeConfig::default(),
            recovery: RecoveryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from the process environment.
    ///
    /// Missing venue credentials with trading enabled is a fatal
    /// `ConfigError`; without trading the engine runs observe-only.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();

        config.dashboard_port = env_parse("DASHBOARD_PORT", config.dashboard_port);
        config.news_dashboard_poll_ms =
            env_parse("NEWS_DASHBOARD_POLL_MS", config.news_dashboard_poll_ms);
        config.private_key = env_nonempty("HYPERLIQUID_PRIVATE_KEY");
        config.main_address = env_nonempty("HYPERLIQUID_MAIN_ADDRESS");
        config.testnet = env_parse("HYPERLIQUID_TESTNET", config.testnet);
        config.trading_enabled = env_parse("TRADING_ENABLED", config.trading_enabled);
        config.api_token = env_nonempty("API_TOKEN");
        config.cycle_interval_secs =
            env_parse("CYCLE_INTERVAL_SECS", config.cycle_interval_secs);
        config.data_dir = env_nonempty("DATA_DIR").unwrap_or(config.data_dir);
        config.recovery.max_attempts =
            env_parse("MAX_RECOVERY_ATTEMPTS", config.recovery.max_attempts);
        config.churn.min_confidence =
            env_parse("MIN_SIGNAL_CONFIDENCE", config.churn.min_confidence);
        config.engine.max_signals_per_minute = env_parse(
            "MAX_SIGNALS_PER_MINUTE",
            config.engine.max_signals_per_minute,
        );

        if let Some(symbols) = env_nonempty("TRADING_SYMBOLS") {
            config.symbols = split_list(&symbols);
        }
        if let Some(timeframes) = env_nonempty("TRADING_TIMEFRAMES") {
            config.timeframes = split_list(&timeframes);
        }

        config.validate()?;

        info!(
            symbols = ?config.symbols,
            timeframes = ?config.timeframes,
            trading_enabled = config.trading_enabled,
            environment = config.environment(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// TESTNET / LIVE label exposed through the portfolio endpoint.
    pub fn environment(&self) -> &'static str {
        if self.testnet {
            "TESTNET"
        } else {
            "LIVE"
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.trading_enabled && self.private_key.is_none() {
            return Err(EngineError::Config(
                "TRADING_ENABLED is set but HYPERLIQUID_PRIVATE_KEY is missing".to_string(),
            ));
        }
        if self.symbols.is_empty() {
            return Err(EngineError::Config("no trading symbols configured".to_string()));
        }
        if self.timeframes.is_empty() {
            return Err(EngineError::Config("no timeframes configured".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Env helpers
// =============================================================================

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.dashboard_port, 3001);
        assert_eq!(cfg.news_dashboard_poll_ms, 10_000);
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.churn.min_order_interval_secs, 30);
        assert_eq!(cfg.churn.cooldown_secs, 600);
        assert!((cfg.churn.min_confidence - 0.80).abs() < f64::EPSILON);
        assert_eq!(cfg.engine.max_signals_per_minute, 3);
        assert_eq!(cfg.engine.signal_dedup_window_secs, 300);
        assert!((cfg.exchange.max_spread - 0.001).abs() < f64::EPSILON);
        assert!((cfg.exchange.slippage - 0.005).abs() < f64::EPSILON);
        assert_eq!(cfg.exchange.stale_order_cancel_secs, 60);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.open_ms, 60_000);
        assert_eq!(cfg.breaker.max_consecutive_cycle_errors, 5);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH", "SOL"]);
        assert_eq!(cfg.timeframes, vec!["1h"]);
        assert!(cfg.testnet);
        assert!(!cfg.trading_enabled);
    }

    #[test]
    fn trading_without_key_is_fatal() {
        let cfg = EngineConfig {
            trading_enabled: true,
            private_key: None,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn observe_only_without_key_is_fine() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn split_list_normalises() {
        assert_eq!(split_list("btc, eth ,,sol"), vec!["BTC", "ETH", "SOL"]);
    }

    #[test]
    fn environment_label() {
        let mut cfg = EngineConfig::default();
        assert_eq!(cfg.environment(), "TESTNET");
        cfg.testnet = false;
        assert_eq!(cfg.environment(), "LIVE");
    }

    #[test]
    fn private_key_never_serialised() {
        let cfg = EngineConfig {
            private_key: Some("secret".to_string()),
            api_token: Some("token".to_string()),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("token"));
    }
}
