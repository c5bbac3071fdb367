// =============================================================================
// Churn Guard — per-symbol order hygiene for the exchange client
// =============================================================================
//
// Tracks `{submitted, filled, failed, consecutive_failures}` per symbol and
// enforces the entry gates: hard minimum interval, cooldown (extended
// exponentially after repeated failures), minimum confidence, and the
// critical fill-rate shutoff. Reduce-only / exit orders never pass through
// here — that bypass is the caller's contract.
//
// Each symbol's state sits behind its own mutex: checks and updates on one
// symbol are serialized, different symbols never contend.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ChurnConfig;
use crate::error::EngineError;
use crate::types::RejectReason;

/// Per-symbol order accounting.
#[derive(Debug, Default)]
struct SymbolStats {
    submitted: u64,
    filled: u64,
    failed: u64,
    consecutive_failures: u32,
    last_order_time: Option<Instant>,
}

/// Serialisable per-symbol snapshot for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatsSnapshot {
    pub symbol: String,
    pub submitted: u64,
    pub filled: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub fill_rate: f64,
    /// Seconds since the last submission, if any.
    pub last_order_age_secs: Option<u64>,
}

pub struct ChurnGuard {
    config: ChurnConfig,
    stats: RwLock<HashMap<String, Arc<Mutex<SymbolStats>>>>,
}

impl ChurnGuard {
    pub fn new(config: ChurnConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
        }
    }

    fn symbol(&self, symbol: &str) -> Arc<Mutex<SymbolStats>> {
        if let Some(s) = self.stats.read().get(symbol) {
            return s.clone();
        }
        self.stats
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Cooldown required after the most recent order, given the failure
    /// streak. At or past the failure threshold the extended unit doubles per
    /// additional failure.
    fn required_cooldown_secs(&self, consecutive_failures: u32) -> u64 {
        let threshold = self.config.consecutive_failure_threshold;
        if consecutive_failures < threshold {
            return self.config.cooldown_secs;
        }
        let exponent = (consecutive_failures - threshold + 1).min(6);
        let extended = self.config.extended_cooldown_secs << exponent;
        extended.max(self.config.cooldown_secs)
    }

    // -------------------------------------------------------------------------
    // Entry gate
    // -------------------------------------------------------------------------

    /// Gate an entry order. Exits must not be routed through this check.
    pub fn check_entry(&self, symbol: &str, confidence: f64) -> Result<(), EngineError> {
        if confidence < self.config.min_confidence {
            return Err(EngineError::validation(
                RejectReason::BelowMinConfidence,
                format!(
                    "{symbol}: confidence {confidence:.2} below minimum {:.2}",
                    self.config.min_confidence
                ),
            ));
        }

        let cell = self.symbol(symbol);
        let s = cell.lock();

        if let Some(last) = s.last_order_time {
            let elapsed = last.elapsed().as_secs();

            if elapsed < self.config.min_order_interval_secs {
                return Err(EngineError::validation(
                    RejectReason::MinInterval,
                    format!(
                        "{symbol}: {elapsed}s since last order, minimum {}s",
                        self.config.min_order_interval_secs
                    ),
                ));
            }

            let required = self.required_cooldown_secs(s.consecutive_failures);
            if elapsed < required {
                return Err(EngineError::validation(
                    RejectReason::Cooldown,
                    format!(
                        "{symbol}: cooldown {required}s ({} consecutive failures), {elapsed}s elapsed",
                        s.consecutive_failures
                    ),
                ));
            }
        }

        if s.submitted >= self.config.fill_rate_warmup as u64 {
            let fill_rate = s.filled as f64 / s.submitted as f64;
            if fill_rate < self.config.critical_fill_rate {
                warn!(
                    symbol,
                    fill_rate,
                    submitted = s.submitted,
                    filled = s.filled,
                    "fill rate below critical floor — symbol shut off"
                );
                return Err(EngineError::validation(
                    RejectReason::ChurnPrevention,
                    format!(
                        "{symbol}: fill rate {:.1}% below critical {:.1}%",
                        fill_rate * 100.0,
                        self.config.critical_fill_rate * 100.0
                    ),
                ));
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    /// Record a submission attempt. Stamps `last_order_time`; per symbol this
    /// is monotone because the caller holds the symbol order lock.
    pub fn record_submitted(&self, symbol: &str) {
        let cell = self.symbol(symbol);
        let mut s = cell.lock();
        s.submitted += 1;
        s.last_order_time = Some(Instant::now());
    }

    /// A fill resets the failure streak and counts toward the fill rate.
    pub fn record_fill(&self, symbol: &str) {
        let cell = self.symbol(symbol);
        let mut s = cell.lock();
        s.filled += 1;
        s.consecutive_failures = 0;
        debug!(symbol, filled = s.filled, submitted = s.submitted, "fill recorded");
    }

    /// A resting order is a successful submission; the streak resets but the
    /// fill rate is unchanged until it actually fills.
    pub fn record_resting(&self, symbol: &str) {
        let cell = self.symbol(symbol);
        cell.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self, symbol: &str) {
        let cell = self.symbol(symbol);
        let mut s = cell.lock();
        s.failed += 1;
        s.consecutive_failures += 1;
        debug!(
            symbol,
            failed = s.failed,
            consecutive = s.consecutive_failures,
            "order failure recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn snapshots(&self) -> Vec<SymbolStatsSnapshot> {
        let stats = self.stats.read();
        let mut out: Vec<SymbolStatsSnapshot> = stats
            .iter()
            .map(|(symbol, cell)| {
                let s = cell.lock();
                SymbolStatsSnapshot {
                    symbol: symbol.clone(),
                    submitted: s.submitted,
                    filled: s.filled,
                    failed: s.failed,
                    consecutive_failures: s.consecutive_failures,
                    fill_rate: if s.submitted > 0 {
                        s.filled as f64 / s.submitted as f64
                    } else {
                        0.0
                    },
                    last_order_age_secs: s.last_order_time.map(|t| t.elapsed().as_secs()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejectReason;

    fn guard() -> ChurnGuard {
        ChurnGuard::new(ChurnConfig::default())
    }

    fn reject_reason(err: EngineError) -> RejectReason {
        match err {
            EngineError::Validation { reason, .. } => reason,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn confidence_exactly_at_threshold_accepted() {
        let g = guard();
        assert!(g.check_entry("BTC", 0.80).is_ok());
    }

    #[test]
    fn confidence_below_threshold_rejected() {
        let g = guard();
        let err = g.check_entry("BTC", 0.79).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::BelowMinConfidence);
    }

    #[test]
    fn min_interval_blocks_immediate_resubmission() {
        let g = guard();
        g.record_submitted("BTC");
        let err = g.check_entry("BTC", 0.9).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::MinInterval);
    }

    #[test]
    fn fresh_symbol_has_no_cooldown() {
        let g = guard();
        assert!(g.check_entry("NEW", 0.9).is_ok());
    }

    #[test]
    fn cooldown_extends_exponentially_past_threshold() {
        let cfg = ChurnConfig::default();
        let g = ChurnGuard::new(cfg.clone());

        // Below the threshold the standard cooldown applies.
        assert_eq!(g.required_cooldown_secs(0), cfg.cooldown_secs);
        assert_eq!(g.required_cooldown_secs(2), cfg.cooldown_secs);

        // At the threshold the extended unit doubles: 300 * 2 = 600s.
        assert_eq!(g.required_cooldown_secs(3), 600);
        assert_eq!(g.required_cooldown_secs(4), 1_200);
        assert_eq!(g.required_cooldown_secs(5), 2_400);

        // The exponent is clamped so the wait stays bounded.
        assert_eq!(g.required_cooldown_secs(40), 300 << 6);
    }

    #[test]
    fn critical_fill_rate_shuts_symbol_off() {
        let g = ChurnGuard::new(ChurnConfig {
            min_order_interval_secs: 0,
            cooldown_secs: 0,
            ..ChurnConfig::default()
        });

        // Five submissions, zero fills: 0% < 5% after warm-up.
        for _ in 0..5 {
            g.record_submitted("SOL");
            g.record_failure("SOL");
        }
        let err = g.check_entry("SOL", 0.9).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::ChurnPrevention);
    }

    #[test]
    fn fill_rate_gate_waits_for_warmup() {
        let g = ChurnGuard::new(ChurnConfig {
            min_order_interval_secs: 0,
            cooldown_secs: 0,
            ..ChurnConfig::default()
        });

        // Four failed submissions: still inside warm-up, not shut off.
        for _ in 0..4 {
            g.record_submitted("SOL");
            g.record_failure("SOL");
        }
        assert!(g.check_entry("SOL", 0.9).is_ok());
    }

    #[test]
    fn fill_resets_failure_streak() {
        let g = guard();
        for _ in 0..4 {
            g.record_submitted("ETH");
            g.record_failure("ETH");
        }
        g.record_fill("ETH");

        let snap = &g.snapshots()[0];
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.filled, 1);
        assert_eq!(snap.failed, 4);
    }

    #[test]
    fn snapshots_are_per_symbol() {
        let g = guard();
        g.record_submitted("BTC");
        g.record_submitted("ETH");
        g.record_fill("ETH");

        let snaps = g.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].symbol, "BTC");
        assert_eq!(snaps[1].symbol, "ETH");
        assert_eq!(snaps[1].fill_rate, 1.0);
    }
}
