//! Plan B: trend filter on the slow timeframe, pullback/breakout trigger on the fast one.

use crate::config::ScalpParams;
use crate::indicators::{self, ema, validate_bars, IndicatorError, IndicatorSnapshot, SCALP_MIN_HISTORY};
use crate::strategy::{MarketContext, SignalEngine, SignalReport, MAX_CONFIDENCE};
use crate::types::{Candle, CombinedSignal, Direction, NamedVote, Quote, Suppression, Vote};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrendBias {
    LongOnly,
    ShortOnly,
    NoTrade,
}

impl TrendBias {
    pub fn direction(self) -> Direction {
        match self {
            TrendBias::LongOnly => Direction::Long,
            TrendBias::ShortOnly => Direction::Short,
            TrendBias::NoTrade => Direction::Neutral,
        }
    }
}

/// Slow-timeframe bias: fast EMA vs slow EMA at the last closed bar.
pub fn trend_filter(bars: &[Candle], params: &ScalpParams) -> Result<(TrendBias, Vote), IndicatorError> {
    if bars.len() < params.filter_ema_slow {
        return Err(IndicatorError::InsufficientHistory {
            required: params.filter_ema_slow,
            available: bars.len(),
        });
    }
    validate_bars(bars)?;
    let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
    let fast = ema(&closes, params.filter_ema_fast).last().copied().unwrap_or(f64::NAN);
    let slow = ema(&closes, params.filter_ema_slow).last().copied().unwrap_or(f64::NAN);

    let bias = if fast > slow {
        TrendBias::LongOnly
    } else if fast < slow {
        TrendBias::ShortOnly
    } else {
        TrendBias::NoTrade
    };
    let rationale = format!(
        "EMA{} {:.5} vs EMA{} {:.5}",
        params.filter_ema_fast, fast, params.filter_ema_slow, slow
    );
    Ok((bias, Vote::new(bias.direction(), rationale)))
}

pub fn pullback_trigger(s: &IndicatorSnapshot, dir: Direction, params: &ScalpParams) -> Vote {
    let dist = s.distance_to_ema20();
    if dist >= params.pullback_dist_pct / 100.0 {
        return Vote::neutral(format!("price {:.3}% from EMA20", dist * 100.0));
    }
    let candle_ok = match dir {
        Direction::Long => s.is_bullish(),
        Direction::Short => s.is_bearish(),
        Direction::Neutral => false,
    };
    let rsi_ok = s.rsi >= params.rsi_low && s.rsi <= params.rsi_high;
    if candle_ok && rsi_ok {
        Vote::new(dir, format!("pullback to EMA20, RSI {:.1}", s.rsi))
    } else {
        Vote::neutral(format!("pullback miss: candle_ok={} RSI {:.1}", candle_ok, s.rsi))
    }
}

pub fn breakout_trigger(s: &IndicatorSnapshot, dir: Direction, params: &ScalpParams) -> Vote {
    let volume_ok = s.volume_ratio >= params.breakout_vol_ratio;
    let broke = match dir {
        Direction::Long => s.close > s.bb_upper,
        Direction::Short => s.close < s.bb_lower,
        Direction::Neutral => false,
    };
    if broke && volume_ok {
        Vote::new(dir, format!("band breakout, vol x{:.2}", s.volume_ratio))
    } else {
        Vote::neutral(format!("no breakout, vol x{:.2}", s.volume_ratio))
    }
}

/// Chop: weak trend strength and narrow bands together.
pub fn is_chop(s: &IndicatorSnapshot, params: &ScalpParams) -> bool {
    s.adx < params.regime_adx_min && s.bb_width < params.regime_bb_width_min
}

/// Live spread in percent of mid.
pub fn spread_pct(q: &Quote) -> f64 {
    let mid = q.mid();
    if mid <= 0.0 {
        return 0.0;
    }
    q.spread() / mid * 100.0
}

pub struct ScalpEngine {
    params: ScalpParams,
}

impl ScalpEngine {
    pub fn new(params: ScalpParams) -> Self {
        ScalpEngine { params }
    }

    fn combine(&self, s: &IndicatorSnapshot, bias: TrendBias, trend: Vote, quote: Option<Quote>) -> CombinedSignal {
        let dir = bias.direction();
        let mut breakdown = vec![NamedVote { name: "trend_filter", vote: trend }];

        if bias == TrendBias::NoTrade {
            let mut sig = CombinedSignal::neutral("SCALP NO SIGNAL | no slow-timeframe trend");
            sig.breakdown = breakdown;
            sig.suppressed = Some(Suppression::NoTrend);
            return sig;
        }

        let pullback = pullback_trigger(s, dir, &self.params);
        let breakout = breakout_trigger(s, dir, &self.params);
        let fired = [&pullback, &breakout]
            .iter()
            .filter(|v| v.direction != Direction::Neutral)
            .count() as u8;
        let trigger = match (pullback.direction != Direction::Neutral, breakout.direction != Direction::Neutral) {
            (true, true) => "both",
            (true, false) => "pullback",
            (false, true) => "breakout",
            (false, false) => "none",
        };
        breakdown.push(NamedVote { name: "pullback", vote: pullback });
        breakdown.push(NamedVote { name: "breakout", vote: breakout });

        let (long_votes, short_votes) = match dir {
            Direction::Long => (fired, 0),
            _ => (0, fired),
        };
        let mut sig = CombinedSignal {
            direction: Direction::Neutral,
            confidence: 0,
            long_votes,
            short_votes,
            breakdown,
            detail: format!("SCALP NO SIGNAL | bias {}", dir),
            suppressed: None,
        };
        if fired == 0 {
            return sig;
        }

        if self.params.regime_filter && is_chop(s, &self.params) {
            sig.suppressed = Some(Suppression::Regime);
            sig.detail = format!(
                "SCALP {} ({}) FILTERED: chop regime ADX {:.1} width {:.4}",
                dir, trigger, s.adx, s.bb_width
            );
            return sig;
        }

        if self.params.spread_filter {
            if let Some(q) = quote {
                let spread = spread_pct(&q);
                if spread > self.params.max_spread_pct {
                    sig.suppressed = Some(Suppression::Spread);
                    sig.detail = format!(
                        "SCALP {} ({}) FILTERED: spread {:.4}% > {:.4}%",
                        dir, trigger, spread, self.params.max_spread_pct
                    );
                    return sig;
                }
            }
        }

        sig.direction = dir;
        sig.confidence = MAX_CONFIDENCE;
        sig.detail = format!("SCALP {} ({})", dir, trigger);
        sig
    }
}

impl SignalEngine for ScalpEngine {
    fn name(&self) -> &'static str {
        "plan_b_scalp"
    }

    fn entry_history(&self) -> usize {
        SCALP_MIN_HISTORY
    }

    fn filter_history(&self) -> Option<usize> {
        Some(self.params.filter_ema_slow)
    }

    fn evaluate(&self, ctx: &MarketContext<'_>) -> Result<SignalReport, IndicatorError> {
        let snapshot = indicators::snapshot(ctx.entry_bars, SCALP_MIN_HISTORY)?;
        let filter_bars = ctx.filter_bars.unwrap_or(&[]);
        let (bias, trend) = trend_filter(filter_bars, &self.params)?;
        let signal = self.combine(&snapshot, bias, trend, ctx.quote);
        Ok(SignalReport { signal, snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_bars;

    fn snap() -> IndicatorSnapshot {
        IndicatorSnapshot {
            open: 0.998,
            close: 1.001,
            ema20: 1.0,
            rsi: 50.0,
            adx: 30.0,
            bb_upper: 1.02,
            bb_mid: 1.0,
            bb_lower: 0.98,
            bb_width: 0.04,
            volume_ratio: 1.0,
            ..Default::default()
        }
    }

    fn engine() -> ScalpEngine {
        ScalpEngine::new(ScalpParams::default())
    }

    fn long_bias() -> Vote {
        Vote::new(Direction::Long, "test")
    }

    #[test]
    fn pullback_long_fires_at_full_confidence() {
        let sig = engine().combine(&snap(), TrendBias::LongOnly, long_bias(), None);
        assert_eq!(sig.direction, Direction::Long);
        assert_eq!(sig.confidence, MAX_CONFIDENCE);
        assert!(sig.detail.contains("pullback"));
    }

    #[test]
    fn pullback_distance_is_strict() {
        let p = ScalpParams::default();
        let mut s = snap();
        s.close = 1.0031;
        assert_eq!(pullback_trigger(&s, Direction::Long, &p).direction, Direction::Neutral);
        s.close = 1.0029;
        assert_eq!(pullback_trigger(&s, Direction::Long, &p).direction, Direction::Long);
    }

    #[test]
    fn pullback_rsi_band_is_inclusive() {
        let p = ScalpParams::default();
        let mut s = snap();
        s.rsi = 65.0;
        assert_eq!(pullback_trigger(&s, Direction::Long, &p).direction, Direction::Long);
        s.rsi = 65.1;
        assert_eq!(pullback_trigger(&s, Direction::Long, &p).direction, Direction::Neutral);
    }

    #[test]
    fn triggers_only_in_permitted_direction() {
        let mut s = snap();
        s.open = 1.004;
        s.close = 0.999;
        // bearish pullback under a long bias
        let sig = engine().combine(&s, TrendBias::LongOnly, long_bias(), None);
        assert_eq!(sig.direction, Direction::Neutral);
        assert_eq!(sig.suppressed, None);

        let sig = engine().combine(&s, TrendBias::ShortOnly, Vote::new(Direction::Short, "t"), None);
        assert_eq!(sig.direction, Direction::Short);
    }

    #[test]
    fn breakout_needs_volume() {
        let p = ScalpParams::default();
        let mut s = snap();
        s.close = 1.03;
        s.volume_ratio = 1.5;
        assert_eq!(breakout_trigger(&s, Direction::Long, &p).direction, Direction::Long);
        s.volume_ratio = 1.49;
        assert_eq!(breakout_trigger(&s, Direction::Long, &p).direction, Direction::Neutral);
    }

    #[test]
    fn no_trend_suppresses_everything() {
        let sig = engine().combine(&snap(), TrendBias::NoTrade, Vote::neutral("flat"), None);
        assert_eq!(sig.direction, Direction::Neutral);
        assert_eq!(sig.suppressed, Some(Suppression::NoTrend));
    }

    #[test]
    fn chop_regime_is_reported_as_filtered() {
        let mut s = snap();
        s.adx = 15.0;
        s.bb_width = 0.003;
        let sig = engine().combine(&s, TrendBias::LongOnly, long_bias(), None);
        assert_eq!(sig.direction, Direction::Neutral);
        assert_eq!(sig.suppressed, Some(Suppression::Regime));
        assert_eq!(sig.long_votes, 1);

        // only one of the two conditions: not chop
        s.adx = 25.0;
        let sig = engine().combine(&s, TrendBias::LongOnly, long_bias(), None);
        assert_eq!(sig.direction, Direction::Long);
    }

    #[test]
    fn regime_filter_can_be_disabled() {
        let mut s = snap();
        s.adx = 15.0;
        s.bb_width = 0.003;
        let params = ScalpParams { regime_filter: false, ..ScalpParams::default() };
        let sig = ScalpEngine::new(params).combine(&s, TrendBias::LongOnly, long_bias(), None);
        assert_eq!(sig.direction, Direction::Long);
    }

    #[test]
    fn wide_spread_suppresses() {
        let wide = Quote { last: 1.0, bid: 0.999, ask: 1.001 };
        let sig = engine().combine(&snap(), TrendBias::LongOnly, long_bias(), Some(wide));
        assert_eq!(sig.suppressed, Some(Suppression::Spread));

        let tight = Quote { last: 1.0, bid: 0.9999, ask: 1.0001 };
        let sig = engine().combine(&snap(), TrendBias::LongOnly, long_bias(), Some(tight));
        assert_eq!(sig.direction, Direction::Long);
    }

    #[test]
    fn trend_filter_reads_ema_order() {
        let rising: Vec<f64> = (0..220).map(|i| 1.0 + i as f64 * 0.001).collect();
        let (bias, _) = trend_filter(&test_bars::from_closes(&rising), &ScalpParams::default()).unwrap();
        assert_eq!(bias, TrendBias::LongOnly);

        let falling: Vec<f64> = (0..220).map(|i| 2.0 - i as f64 * 0.001).collect();
        let (bias, _) = trend_filter(&test_bars::from_closes(&falling), &ScalpParams::default()).unwrap();
        assert_eq!(bias, TrendBias::ShortOnly);
    }

    #[test]
    fn missing_filter_history_is_an_input_error() {
        let entry = test_bars::wave(80, 1.0);
        let short = test_bars::wave(100, 1.0);
        let ctx = MarketContext { entry_bars: &entry, filter_bars: Some(&short), quote: None };
        assert!(matches!(
            engine().evaluate(&ctx),
            Err(IndicatorError::InsufficientHistory { required: 200, available: 100 })
        ));
    }
}
