// =============================================================================
// Venue Metadata — asset indices, tick sizes, and size formatting
// =============================================================================
//
// The venue addresses assets by index, so the first call of the session pulls
// the universe and builds the symbol <-> index map (cached for an hour,
// re-fetched on a miss). Price and size formatting is per-symbol: prices snap
// to the tick, sizes round to the symbol's decimals and up to its minimum.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;

/// Venue metadata cache lifetime.
pub const META_TTL_SECS: u64 = 3_600;

/// Symbol <-> asset-index mapping pulled from the venue universe.
#[derive(Debug, Clone)]
pub struct VenueMeta {
    assets: HashMap<String, u32>,
    pub fetched_at: Instant,
}

impl VenueMeta {
    /// Parse a `meta` info response: `{"universe": [{"name": "BTC", ...}, ...]}`.
    pub fn from_response(body: &Value) -> Result<Self, EngineError> {
        let universe = body
            .get("universe")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::Network("meta response missing 'universe'".into()))?;

        let mut assets = HashMap::with_capacity(universe.len());
        for (index, entry) in universe.iter().enumerate() {
            if let Some(name) = entry.get("name").and_then(|v| v.as_str()) {
                assets.insert(name.to_string(), index as u32);
            }
        }

        debug!(assets = assets.len(), "venue metadata parsed");
        Ok(Self {
            assets,
            fetched_at: Instant::now(),
        })
    }

    pub fn asset_index(&self, symbol: &str) -> Option<u32> {
        self.assets.get(symbol).copied()
    }

    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed().as_secs() >= META_TTL_SECS
    }
}

// =============================================================================
// Per-symbol formatting rules
// =============================================================================

/// Price tick in dollars.
pub fn tick_size(symbol: &str) -> f64 {
    match symbol {
        "BTC" => 1.0,
        "ETH" => 0.1,
        _ => 0.01,
    }
}

/// Decimal places carried by a formatted size.
pub fn size_decimals(symbol: &str) -> u32 {
    match symbol {
        "BTC" => 5,
        _ => 4,
    }
}

/// Smallest tradable size.
pub fn min_size(symbol: &str) -> f64 {
    match symbol {
        "BTC" => 0.0001,
        "ETH" => 0.001,
        "SOL" => 0.01,
        _ => 0.01,
    }
}

/// Snap a price to the symbol's tick and render it for the wire.
pub fn format_price(symbol: &str, price: f64) -> String {
    let tick = tick_size(symbol);
    let snapped = (price / tick).round() * tick;
    let decimals = match symbol {
        "BTC" => 0,
        "ETH" => 1,
        _ => 2,
    };
    format!("{snapped:.decimals$}", decimals = decimals as usize)
}

/// Validate and normalize an order size.
///
/// Zero or negative is fatal; anything below the symbol minimum rounds up to
/// it; everything else rounds to the symbol's size decimals.
pub fn validate_size(symbol: &str, size: f64) -> Result<f64, EngineError> {
    if size <= 0.0 || !size.is_finite() {
        return Err(EngineError::InvalidSize(format!(
            "{symbol}: size {size} must be positive"
        )));
    }

    let min = min_size(symbol);
    if size < min {
        debug!(symbol, size, min, "size below minimum — rounding up");
        return Ok(min);
    }

    let factor = 10f64.powi(size_decimals(symbol) as i32);
    Ok((size * factor).round() / factor)
}

/// Render a validated size for the wire.
pub fn format_size(symbol: &str, size: f64) -> String {
    let decimals = size_decimals(symbol) as usize;
    let mut s = format!("{size:.decimals$}");
    // The venue rejects trailing zeros beyond the significant digits.
    while s.contains('.') && (s.ends_with('0') || s.ends_with('.')) {
        s.pop();
    }
    s
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_parses_universe() {
        let body = serde_json::json!({
            "universe": [
                { "name": "BTC", "szDecimals": 5 },
                { "name": "ETH", "szDecimals": 4 },
                { "name": "SOL", "szDecimals": 2 },
            ]
        });
        let meta = VenueMeta::from_response(&body).unwrap();
        assert_eq!(meta.asset_index("BTC"), Some(0));
        assert_eq!(meta.asset_index("SOL"), Some(2));
        assert_eq!(meta.asset_index("DOGE"), None);
        assert!(!meta.is_expired());
    }

    #[test]
    fn meta_missing_universe_is_error() {
        let body = serde_json::json!({ "oops": [] });
        assert!(VenueMeta::from_response(&body).is_err());
    }

    #[test]
    fn tick_sizes_per_symbol() {
        assert_eq!(tick_size("BTC"), 1.0);
        assert_eq!(tick_size("ETH"), 0.1);
        assert_eq!(tick_size("SOL"), 0.01);
        assert_eq!(tick_size("DOGE"), 0.01);
    }

    #[test]
    fn price_snaps_to_tick() {
        assert_eq!(format_price("BTC", 50_000.4), "50000");
        assert_eq!(format_price("BTC", 50_000.6), "50001");
        assert_eq!(format_price("ETH", 3_000.07), "3000.1");
        assert_eq!(format_price("SOL", 150.123), "150.12");
    }

    #[test]
    fn size_exactly_at_minimum_unchanged() {
        assert_eq!(validate_size("BTC", 0.0001).unwrap(), 0.0001);
        assert_eq!(validate_size("ETH", 0.001).unwrap(), 0.001);
        assert_eq!(validate_size("SOL", 0.01).unwrap(), 0.01);
    }

    #[test]
    fn size_below_minimum_rounds_up() {
        assert_eq!(validate_size("BTC", 0.00009).unwrap(), 0.0001);
        assert_eq!(validate_size("SOL", 0.002).unwrap(), 0.01);
    }

    #[test]
    fn zero_and_negative_sizes_rejected() {
        assert!(matches!(
            validate_size("BTC", 0.0),
            Err(EngineError::InvalidSize(_))
        ));
        assert!(matches!(
            validate_size("BTC", -1.0),
            Err(EngineError::InvalidSize(_))
        ));
        assert!(matches!(
            validate_size("BTC", f64::NAN),
            Err(EngineError::InvalidSize(_))
        ));
    }

    #[test]
    fn size_rounds_to_symbol_decimals() {
        assert_eq!(validate_size("BTC", 0.123456789).unwrap(), 0.12346);
        assert_eq!(validate_size("ETH", 1.00005).unwrap(), 1.0001);
    }

    #[test]
    fn wire_size_trims_trailing_zeros() {
        assert_eq!(format_size("BTC", 0.01000), "0.01");
        assert_eq!(format_size("ETH", 2.0), "2");
        assert_eq!(format_size("SOL", 1.2345), "1.2345");
    }
}
