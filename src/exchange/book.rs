// =============================================================================
// Order Book — L2 snapshot parsing plus depth and spread validation
// =============================================================================

use serde_json::Value;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::error::EngineError;
use crate::types::RejectReason;

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub px: f64,
    pub sz: f64,
}

/// L2 snapshot. Bids are sorted best-first, asks best-first.
#[derive(Debug, Clone)]
pub struct L2Book {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl L2Book {
    /// Parse the venue's `l2Book` response:
    /// `{"coin": "BTC", "levels": [[{px, sz}...bids], [{px, sz}...asks]]}`.
    pub fn from_response(symbol: &str, body: &Value) -> Result<Self, EngineError> {
        let levels = body
            .get("levels")
            .and_then(|v| v.as_array())
            .filter(|arr| arr.len() == 2)
            .ok_or_else(|| {
                EngineError::Network(format!("{symbol}: l2Book response missing levels"))
            })?;

        let parse_side = |side: &Value| -> Vec<BookLevel> {
            side.as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|lvl| {
                            let px = parse_num(lvl.get("px")?)?;
                            let sz = parse_num(lvl.get("sz")?)?;
                            Some(BookLevel { px, sz })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            symbol: symbol.to_string(),
            bids: parse_side(&levels[0]),
            asks: parse_side(&levels[1]),
        })
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.px)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.px)
    }

    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// `(ask - bid) / mid`.
    pub fn spread_ratio(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        (mid > 0.0).then(|| (ask - bid) / mid)
    }

    /// Notional depth (price * size) across the top `levels` of one side.
    pub fn notional_depth(levels: &[BookLevel], count: usize) -> f64 {
        levels.iter().take(count).map(|l| l.px * l.sz).sum()
    }
}

fn parse_num(v: &Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
}

/// Gate an entry order on book quality: both sides must carry the configured
/// level count and notional floor, and the spread must stay strictly below
/// the maximum (`>=` rejects).
pub fn validate_book(book: &L2Book, cfg: &ExchangeConfig) -> Result<(), EngineError> {
    if book.bids.len() < cfg.depth_levels || book.asks.len() < cfg.depth_levels {
        return Err(EngineError::validation(
            RejectReason::InsufficientDepth,
            format!(
                "{}: need {} levels per side, book has {}x{}",
                book.symbol,
                cfg.depth_levels,
                book.bids.len(),
                book.asks.len()
            ),
        ));
    }

    let bid_depth = L2Book::notional_depth(&book.bids, cfg.depth_levels);
    let ask_depth = L2Book::notional_depth(&book.asks, cfg.depth_levels);
    if bid_depth < cfg.min_depth_notional || ask_depth < cfg.min_depth_notional {
        return Err(EngineError::validation(
            RejectReason::InsufficientDepth,
            format!(
                "{}: notional depth {bid_depth:.0}/{ask_depth:.0} below floor {:.0}",
                book.symbol, cfg.min_depth_notional
            ),
        ));
    }

    let spread = book.spread_ratio().ok_or_else(|| {
        EngineError::validation(
            RejectReason::InsufficientDepth,
            format!("{}: book has no two-sided market", book.symbol),
        )
    })?;
    if spread >= cfg.max_spread {
        return Err(EngineError::validation(
            RejectReason::SpreadTooWide,
            format!(
                "{}: spread {:.4}% at/above maximum {:.4}%",
                book.symbol,
                spread * 100.0,
                cfg.max_spread * 100.0
            ),
        ));
    }

    debug!(
        symbol = %book.symbol,
        bid_depth,
        ask_depth,
        spread_pct = spread * 100.0,
        "book validated"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejectReason;

    /// A deep, tight book around `mid` with `n` levels per side.
    fn healthy_book(mid: f64, n: usize) -> L2Book {
        let tick = mid * 0.0001;
        L2Book {
            symbol: "BTC".to_string(),
            bids: (0..n)
                .map(|i| BookLevel {
                    px: mid - tick * (i as f64 + 1.0),
                    sz: 1.0,
                })
                .collect(),
            asks: (0..n)
                .map(|i| BookLevel {
                    px: mid + tick * (i as f64 + 1.0),
                    sz: 1.0,
                })
                .collect(),
        }
    }

    fn reject_reason(err: EngineError) -> RejectReason {
        match err {
            EngineError::Validation { reason, .. } => reason,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn parses_venue_levels() {
        let body = serde_json::json!({
            "coin": "BTC",
            "levels": [
                [ {"px": "49999", "sz": "0.5"}, {"px": "49998", "sz": "1.0"} ],
                [ {"px": "50001", "sz": "0.4"} ]
            ]
        });
        let book = L2Book::from_response("BTC", &body).unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.best_bid(), Some(49_999.0));
        assert_eq!(book.best_ask(), Some(50_001.0));
        assert_eq!(book.mid(), Some(50_000.0));
    }

    #[test]
    fn healthy_book_passes() {
        let cfg = ExchangeConfig::default();
        assert!(validate_book(&healthy_book(50_000.0, 5), &cfg).is_ok());
    }

    #[test]
    fn thin_book_rejected() {
        let cfg = ExchangeConfig::default();
        let err = validate_book(&healthy_book(50_000.0, 3), &cfg).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::InsufficientDepth);
    }

    #[test]
    fn low_notional_rejected() {
        let cfg = ExchangeConfig::default();
        let mut book = healthy_book(50_000.0, 5);
        for lvl in book.bids.iter_mut().chain(book.asks.iter_mut()) {
            lvl.sz = 0.00001;
        }
        let err = validate_book(&book, &cfg).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::InsufficientDepth);
    }

    #[test]
    fn spread_exactly_at_maximum_rejected() {
        let cfg = ExchangeConfig::default();
        // Spread ratio exactly 0.1%: bid 49975, ask 50025, mid 50000.
        let mut book = healthy_book(50_000.0, 5);
        book.bids[0].px = 49_975.0;
        book.asks[0].px = 50_025.0;
        assert!((book.spread_ratio().unwrap() - cfg.max_spread).abs() < 1e-12);

        let err = validate_book(&book, &cfg).unwrap_err();
        assert_eq!(reject_reason(err), RejectReason::SpreadTooWide);
    }

    #[test]
    fn spread_just_below_maximum_passes() {
        let cfg = ExchangeConfig::default();
        let mut book = healthy_book(50_000.0, 5);
        book.bids[0].px = 49_976.0;
        book.asks[0].px = 50_024.0;
        assert!(validate_book(&book, &cfg).is_ok());
    }
}
