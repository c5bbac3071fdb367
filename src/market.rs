// =============================================================================
// Market Data — candles, indicator set, and regime classification
// =============================================================================
//
// The orchestrator's market-data stage turns a candle snapshot from the venue
// into the indicator set and regime label the downstream stages consume.
// Indicator math uses standard formulations (EMA seeded with SMA, Wilder
// smoothing for ATR/ADX); a series that goes non-finite is treated as not
// ready rather than propagated.
// =============================================================================

use serde::{Deserialize, Serialize};

/// One OHLCV bar, oldest-first in every slice the engine handles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, unix millis.
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Market regime label attached to a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "TRENDING_UP")]
    TrendingUp,
    #[serde(rename = "TRENDING_DOWN")]
    TrendingDown,
    #[serde(rename = "RANGING")]
    Ranging,
    #[serde(rename = "VOLATILE")]
    Volatile,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendingUp => "TRENDING_UP",
            Self::TrendingDown => "TRENDING_DOWN",
            Self::Ranging => "RANGING",
            Self::Volatile => "VOLATILE",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// The indicator snapshot computed once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub atr: f64,
    /// Bollinger band width as a percentage of the middle band.
    pub bollinger_width: f64,
    pub adx: f64,
    pub last_close: f64,
}

impl IndicatorSet {
    /// Compute the full set from a candle window. Returns `None` until enough
    /// history exists (50 bars) or when any series is not ready.
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        if candles.len() < 50 {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let ema_fast = *ema(&closes, 9)?.last()?;
        let ema_slow = *ema(&closes, 21)?.last()?;
        let rsi = rsi(&closes, 14)?;
        let atr = atr(candles, 14)?;
        let bollinger_width = bollinger_width(&closes, 20, 2.0)?;
        let adx = adx(candles, 14)?;
        let last_close = *closes.last()?;

        Some(Self {
            ema_fast,
            ema_slow,
            rsi,
            atr,
            bollinger_width,
            adx,
            last_close,
        })
    }

    /// Classify the regime from the indicator snapshot.
    ///
    ///   VOLATILE      — band width above 5 %
    ///   TRENDING_UP   — ADX > 25 with the fast EMA above the slow
    ///   TRENDING_DOWN — ADX > 25 with the fast EMA below the slow
    ///   RANGING       — everything else with ADX < 20
    ///   UNKNOWN       — the in-between zone
    pub fn regime(&self) -> Regime {
        if self.bollinger_width > 5.0 {
            Regime::Volatile
        } else if self.adx > 25.0 {
            if self.ema_fast >= self.ema_slow {
                Regime::TrendingUp
            } else {
                Regime::TrendingDown
            }
        } else if self.adx < 20.0 {
            Regime::Ranging
        } else {
            Regime::Unknown
        }
    }
}

// =============================================================================
// Indicator math
// =============================================================================

/// EMA series seeded with the SMA of the first `period` closes.
fn ema(closes: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let mut series = Vec::with_capacity(closes.len() - period + 1);
    series.push(seed);
    let mut prev = seed;
    for &close in &closes[period..] {
        let value = close * multiplier + prev * (1.0 - multiplier);
        if !value.is_finite() {
            return None;
        }
        series.push(value);
        prev = value;
    }
    Some(series)
}

/// Most recent RSI using Wilder smoothing.
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let period_f = period as f64;
    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    let value = 100.0 - 100.0 / (1.0 + rs);
    value.is_finite().then_some(value)
}

/// Most recent ATR using Wilder smoothing over True Range.
fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let tr: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - w[0].close).abs();
            let lc = (w[1].low - w[0].close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let mut value: f64 = tr[..period].iter().sum::<f64>() / period as f64;
    let period_f = period as f64;
    for &t in &tr[period..] {
        value = (value * (period_f - 1.0) + t) / period_f;
    }
    value.is_finite().then_some(value)
}

/// Bollinger band width as a percentage of the middle band.
fn bollinger_width(closes: &[f64], period: usize, std_mult: f64) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean: f64 = window.iter().sum::<f64>() / period as f64;
    let variance: f64 =
        window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    if mean == 0.0 || !std_dev.is_finite() {
        return None;
    }
    Some((2.0 * std_mult * std_dev / mean) * 100.0)
}

/// Most recent ADX using Wilder smoothing of +DI/-DI.
fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    let mut tr = Vec::with_capacity(candles.len() - 1);

    for w in candles.windows(2) {
        let up = w[1].high - w[0].high;
        let down = w[0].low - w[1].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });

        let hl = w[1].high - w[1].low;
        let hc = (w[1].high - w[0].close).abs();
        let lc = (w[1].low - w[0].close).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let mut smoothed_plus: f64 = plus_dm[..period].iter().sum();
    let mut smoothed_minus: f64 = minus_dm[..period].iter().sum();
    let mut smoothed_tr: f64 = tr[..period].iter().sum();

    let di = |plus: f64, minus: f64, tr: f64| -> Option<f64> {
        if tr == 0.0 {
            return None;
        }
        let plus_di = 100.0 * plus / tr;
        let minus_di = 100.0 * minus / tr;
        let sum = plus_di + minus_di;
        if sum == 0.0 {
            return None;
        }
        Some(100.0 * (plus_di - minus_di).abs() / sum)
    };

    let mut dx_values = Vec::new();
    if let Some(dx) = di(smoothed_plus, smoothed_minus, smoothed_tr) {
        dx_values.push(dx);
    }

    for i in period..tr.len() {
        smoothed_plus = smoothed_plus - smoothed_plus / period_f + plus_dm[i];
        smoothed_minus = smoothed_minus - smoothed_minus / period_f + minus_dm[i];
        smoothed_tr = smoothed_tr - smoothed_tr / period_f + tr[i];
        if let Some(dx) = di(smoothed_plus, smoothed_minus, smoothed_tr) {
            dx_values.push(dx);
        }
    }

    if dx_values.len() < period {
        return None;
    }

    let mut value: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        value = (value * (period_f - 1.0) + dx) / period_f;
    }
    value.is_finite().then_some(value)
}
