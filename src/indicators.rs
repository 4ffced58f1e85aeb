//! Indicator engine.
//!
//! Every series is a causal function of the bar prefix: value `i` only reads
//! bars `0..=i`, so a snapshot taken at an earlier bar equals the snapshot the
//! engine would have produced when that bar was the latest one.
//! Warmup positions are `NaN`.

use serde::Serialize;
use thiserror::Error;

use crate::types::Candle;

pub const RSI_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;
pub const BB_PERIOD: usize = 20;
pub const BB_STD_MULT: f64 = 2.0;
pub const VOLUME_WINDOW: usize = 20;
pub const SQUEEZE_WINDOW: usize = 50;
pub const SQUEEZE_PERCENTILE: f64 = 0.2;

/// Higher-timeframe approximation: a 4x longer EMA on the base timeframe
/// stands in for the EMA of 4x longer bars (1H EMA80 ~ 4H EMA20,
/// 1H EMA200 ~ 4H EMA50). Intentional; changing it changes strategy behaviour.
pub const HTF_MULTIPLIER: usize = 4;

/// Bars needed before the Plan A snapshot is complete (EMA200).
pub const PLAN_A_MIN_HISTORY: usize = 200;
/// Bars needed on the scalp trigger timeframe.
pub const SCALP_MIN_HISTORY: usize = 50;

const EPS: f64 = 1e-12;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient history: need {required} bars, got {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error("malformed bars at index {index}: {reason}")]
    MalformedBars { index: usize, reason: &'static str },
}

/// Rejects sequences that are not strictly time-ordered or carry bad prices.
pub fn validate_bars(bars: &[Candle]) -> Result<(), IndicatorError> {
    for (i, c) in bars.iter().enumerate() {
        let prices = [c.open, c.high, c.low, c.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(IndicatorError::MalformedBars { index: i, reason: "non-positive or non-finite price" });
        }
        if !c.volume.is_finite() || c.volume < 0.0 {
            return Err(IndicatorError::MalformedBars { index: i, reason: "bad volume" });
        }
        if c.high < c.low {
            return Err(IndicatorError::MalformedBars { index: i, reason: "high below low" });
        }
        if i > 0 && c.timestamp <= bars[i - 1].timestamp {
            return Err(IndicatorError::MalformedBars { index: i, reason: "timestamps not increasing" });
        }
    }
    Ok(())
}

// ── Primitive series ──────────────────────────────────────────────────────────

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..n {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// EMA with alpha = 2/(period+1), seeded by the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for i in period..n {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = prev;
    }
    out
}

/// Wilder smoothing (alpha = 1/period). Seeds with the mean of the first
/// `period` finite values, starting at the first finite input.
pub fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }
    let start = match values.iter().position(|v| v.is_finite()) {
        Some(s) => s,
        None => return out,
    };
    if n < start + period || values[start..start + period].iter().any(|v| !v.is_finite()) {
        return out;
    }
    let seed_at = start + period - 1;
    let mut prev = values[start..=seed_at].iter().sum::<f64>() / period as f64;
    out[seed_at] = prev;
    for i in (seed_at + 1)..n {
        if !values[i].is_finite() {
            continue;
        }
        prev = (prev * (period as f64 - 1.0) + values[i]) / period as f64;
        out[i] = prev;
    }
    out
}

/// Wilder RSI. Flat windows read 50, loss-free windows read 100.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut gains = vec![f64::NAN; n];
    let mut losses = vec![f64::NAN; n];
    for i in 1..n {
        let d = closes[i] - closes[i - 1];
        gains[i] = d.max(0.0);
        losses[i] = (-d).max(0.0);
    }
    let avg_gain = wilder_smooth(&gains, period);
    let avg_loss = wilder_smooth(&losses, period);
    avg_gain
        .iter()
        .zip(&avg_loss)
        .map(|(&g, &l)| {
            if g.is_nan() || l.is_nan() {
                f64::NAN
            } else if l <= EPS {
                if g <= EPS { 50.0 } else { 100.0 }
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

pub struct Directional {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// ADX, +DI and -DI with Wilder smoothing.
pub fn adx(bars: &[Candle], period: usize) -> Directional {
    let n = bars.len();
    let mut tr = vec![f64::NAN; n];
    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    for i in 1..n {
        let (cur, prev) = (&bars[i], &bars[i - 1]);
        tr[i] = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }

    let s_tr = wilder_smooth(&tr, period);
    let s_plus = wilder_smooth(&plus_dm, period);
    let s_minus = wilder_smooth(&minus_dm, period);

    let mut plus_di = vec![f64::NAN; n];
    let mut minus_di = vec![f64::NAN; n];
    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        if s_tr[i].is_nan() {
            continue;
        }
        if s_tr[i] <= EPS {
            plus_di[i] = 0.0;
            minus_di[i] = 0.0;
            dx[i] = 0.0;
            continue;
        }
        plus_di[i] = 100.0 * s_plus[i] / s_tr[i];
        minus_di[i] = 100.0 * s_minus[i] / s_tr[i];
        let sum = plus_di[i] + minus_di[i];
        dx[i] = if sum <= EPS { 0.0 } else { 100.0 * (plus_di[i] - minus_di[i]).abs() / sum };
    }

    Directional { adx: wilder_smooth(&dx, period), plus_di, minus_di }
}

pub struct Bands {
    pub upper: Vec<f64>,
    pub mid: Vec<f64>,
    pub lower: Vec<f64>,
    /// (upper - lower) / mid
    pub width: Vec<f64>,
    /// (close - lower) / (upper - lower), 0.5 when the bands collapse.
    pub pct: Vec<f64>,
}

/// Bollinger bands over an SMA with population standard deviation.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Bands {
    let n = closes.len();
    let mid = sma(closes, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];
    let mut pct = vec![f64::NAN; n];
    for i in 0..n {
        if mid[i].is_nan() {
            continue;
        }
        let window = &closes[i + 1 - period..=i];
        let var = window.iter().map(|c| (c - mid[i]).powi(2)).sum::<f64>() / period as f64;
        let sd = var.sqrt();
        upper[i] = mid[i] + k * sd;
        lower[i] = mid[i] - k * sd;
        let range = upper[i] - lower[i];
        width[i] = if mid[i].abs() > EPS { range / mid[i] } else { 0.0 };
        pct[i] = if range.abs() <= EPS * mid[i].abs().max(1.0) {
            0.5
        } else {
            (closes[i] - lower[i]) / range
        };
    }
    Bands { upper, mid, lower, width, pct }
}

/// Percentile rank of each value inside its trailing `window` (average rank
/// for ties, divided by the window length). `NaN` until the window is full.
pub fn rolling_percentile_rank(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..n {
        let slice = &values[i + 1 - window..=i];
        if slice.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let x = values[i];
        let below = slice.iter().filter(|v| **v < x).count() as f64;
        let equal = slice.iter().filter(|v| **v == x).count() as f64;
        out[i] = (below + (equal + 1.0) / 2.0) / window as f64;
    }
    out
}

/// Volume over its trailing mean; 1.0 when the mean is zero or undefined.
pub fn volume_ratio(volumes: &[f64], window: usize) -> Vec<f64> {
    let mean = sma(volumes, window);
    volumes
        .iter()
        .zip(&mean)
        .map(|(&v, &m)| if m.is_finite() && m > EPS { v / m } else { 1.0 })
        .collect()
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Indicator values as of one closed bar.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IndicatorSnapshot {
    pub timestamp: i64,
    pub open: f64,
    pub close: f64,
    pub ema9: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub ema200: f64,
    pub ema20_prev: f64,
    pub ema50_prev: f64,
    pub ema20_htf: f64,
    pub ema50_htf: f64,
    pub rsi: f64,
    pub rsi_prev: f64,
    pub rsi_prev2: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub bb_upper: f64,
    pub bb_mid: f64,
    pub bb_lower: f64,
    pub bb_width: f64,
    pub bb_pct: f64,
    pub bb_width_pctile: f64,
    pub is_squeeze: bool,
    pub squeeze_release: bool,
    pub volume_ratio: f64,
}

impl IndicatorSnapshot {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// |close - EMA20| / EMA20, as a fraction.
    pub fn distance_to_ema20(&self) -> f64 {
        if self.ema20.abs() <= EPS || self.ema20.is_nan() {
            return f64::INFINITY;
        }
        (self.close - self.ema20).abs() / self.ema20
    }
}

/// Full indicator series for a bar window.
pub struct IndicatorSeries {
    timestamps: Vec<i64>,
    open: Vec<f64>,
    close: Vec<f64>,
    ema9: Vec<f64>,
    ema20: Vec<f64>,
    ema50: Vec<f64>,
    ema200: Vec<f64>,
    ema20_htf: Vec<f64>,
    ema50_htf: Vec<f64>,
    rsi: Vec<f64>,
    dir: Directional,
    bands: Bands,
    width_pctile: Vec<f64>,
    volume_ratio: Vec<f64>,
}

impl IndicatorSeries {
    /// Validates the window and computes every series. `min_history` is the
    /// number of bars the caller's strategy needs.
    pub fn compute(bars: &[Candle], min_history: usize) -> Result<Self, IndicatorError> {
        if bars.len() < min_history.max(2) {
            return Err(IndicatorError::InsufficientHistory {
                required: min_history.max(2),
                available: bars.len(),
            });
        }
        validate_bars(bars)?;

        let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|c| c.volume).collect();
        let bands = bollinger(&closes, BB_PERIOD, BB_STD_MULT);
        let width_pctile = rolling_percentile_rank(&bands.width, SQUEEZE_WINDOW);

        Ok(IndicatorSeries {
            timestamps: bars.iter().map(|c| c.timestamp).collect(),
            open: bars.iter().map(|c| c.open).collect(),
            ema9: ema(&closes, 9),
            ema20: ema(&closes, 20),
            ema50: ema(&closes, 50),
            ema200: ema(&closes, 200),
            ema20_htf: ema(&closes, 20 * HTF_MULTIPLIER),
            ema50_htf: ema(&closes, 50 * HTF_MULTIPLIER),
            rsi: rsi(&closes, RSI_PERIOD),
            dir: adx(bars, ADX_PERIOD),
            bands,
            width_pctile,
            volume_ratio: volume_ratio(&volumes, VOLUME_WINDOW),
            close: closes,
        })
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    fn squeeze(&self, i: usize) -> bool {
        self.width_pctile[i] < SQUEEZE_PERCENTILE
    }

    /// Snapshot as of bar `i`; `None` when `i` is out of range.
    pub fn snapshot_at(&self, i: usize) -> Option<IndicatorSnapshot> {
        if i >= self.len() {
            return None;
        }
        let back = |v: &Vec<f64>, k: usize| if i >= k { v[i - k] } else { f64::NAN };
        let is_squeeze = self.squeeze(i);
        let was_squeeze = i > 0 && self.squeeze(i - 1);
        Some(IndicatorSnapshot {
            timestamp: self.timestamps[i],
            open: self.open[i],
            close: self.close[i],
            ema9: self.ema9[i],
            ema20: self.ema20[i],
            ema50: self.ema50[i],
            ema200: self.ema200[i],
            ema20_prev: back(&self.ema20, 1),
            ema50_prev: back(&self.ema50, 1),
            ema20_htf: self.ema20_htf[i],
            ema50_htf: self.ema50_htf[i],
            rsi: self.rsi[i],
            rsi_prev: back(&self.rsi, 1),
            rsi_prev2: back(&self.rsi, 2),
            adx: self.dir.adx[i],
            plus_di: self.dir.plus_di[i],
            minus_di: self.dir.minus_di[i],
            bb_upper: self.bands.upper[i],
            bb_mid: self.bands.mid[i],
            bb_lower: self.bands.lower[i],
            bb_width: self.bands.width[i],
            bb_pct: self.bands.pct[i],
            bb_width_pctile: self.width_pctile[i],
            is_squeeze,
            squeeze_release: was_squeeze && !is_squeeze,
            volume_ratio: self.volume_ratio[i],
        })
    }

    /// Snapshot of the most recent closed bar.
    pub fn latest(&self) -> Option<IndicatorSnapshot> {
        self.len().checked_sub(1).and_then(|i| self.snapshot_at(i))
    }
}

/// Convenience: compute and return the latest snapshot.
pub fn snapshot(bars: &[Candle], min_history: usize) -> Result<IndicatorSnapshot, IndicatorError> {
    let series = IndicatorSeries::compute(bars, min_history)?;
    series.latest().ok_or(IndicatorError::InsufficientHistory {
        required: min_history,
        available: bars.len(),
    })
}

#[cfg(test)]
pub(crate) mod test_bars {
    use crate::types::Candle;

    /// Hourly bars from a close path; open is the previous close.
    pub fn from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let open = if i == 0 { c } else { closes[i - 1] };
                Candle {
                    timestamp: 1_700_000_000_000 + i as i64 * 3_600_000,
                    open,
                    high: open.max(c) * 1.001,
                    low: open.min(c) * 0.999,
                    close: c,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    /// Gentle sine wave around `base`.
    pub fn wave(n: usize, base: f64) -> Vec<Candle> {
        let closes: Vec<f64> = (0..n)
            .map(|i| base * (1.0 + 0.02 * (i as f64 * 0.15).sin()))
            .collect();
        from_closes(&closes)
    }
}
