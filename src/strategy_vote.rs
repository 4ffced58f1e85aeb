//! Plan A: four independent votes on the hourly timeframe.

use crate::indicators::{self, IndicatorError, IndicatorSnapshot, PLAN_A_MIN_HISTORY};
use crate::strategy::{combine_votes, MarketContext, SignalEngine, SignalReport};
use crate::types::{Direction, NamedVote, Vote};

pub const TREND_ADX_MIN: f64 = 20.0;
pub const RSI_OVERSOLD: f64 = 35.0;
pub const RSI_OVERBOUGHT: f64 = 65.0;
pub const BB_PCT_LOW: f64 = 0.05;
pub const BB_PCT_HIGH: f64 = 0.95;
pub const VOLUME_CONFIRM: f64 = 1.0;
pub const PULLBACK_PCT: f64 = 0.005;
pub const MTF_RSI_LONG_MAX: f64 = 55.0;
pub const MTF_RSI_SHORT_MIN: f64 = 45.0;

pub fn trend_vote(s: &IndicatorSnapshot) -> Vote {
    if s.adx.is_nan() || s.adx <= TREND_ADX_MIN {
        return Vote::neutral(format!("ADX {:.1} <= {}", s.adx, TREND_ADX_MIN));
    }
    let above = s.ema20 > s.ema50;
    let was_above = s.ema20_prev > s.ema50_prev;
    match (was_above, above) {
        (false, true) => Vote::new(Direction::Long, format!("EMA20 crossed above EMA50, ADX {:.1}", s.adx)),
        (true, false) => Vote::new(Direction::Short, format!("EMA20 crossed below EMA50, ADX {:.1}", s.adx)),
        _ => Vote::neutral("no EMA20/50 cross"),
    }
}

pub fn momentum_vote(s: &IndicatorSnapshot) -> Vote {
    let turning_up = s.rsi > s.rsi_prev && s.rsi_prev < s.rsi_prev2;
    let turning_down = s.rsi < s.rsi_prev && s.rsi_prev > s.rsi_prev2;
    if s.rsi < RSI_OVERSOLD && turning_up {
        Vote::new(Direction::Long, format!("RSI {:.1} oversold, turning up", s.rsi))
    } else if s.rsi > RSI_OVERBOUGHT && turning_down {
        Vote::new(Direction::Short, format!("RSI {:.1} overbought, turning down", s.rsi))
    } else {
        Vote::neutral(format!("RSI {:.1}", s.rsi))
    }
}

pub fn volatility_vote(s: &IndicatorSnapshot) -> Vote {
    if s.squeeze_release {
        return if s.close > s.bb_mid {
            Vote::new(Direction::Long, "squeeze released above mid band")
        } else if s.close < s.bb_mid {
            Vote::new(Direction::Short, "squeeze released below mid band")
        } else {
            Vote::neutral("squeeze released at mid band")
        };
    }
    if s.volume_ratio > VOLUME_CONFIRM {
        if s.bb_pct < BB_PCT_LOW {
            return Vote::new(Direction::Long, format!("%B {:.2} at lower band on volume", s.bb_pct));
        }
        if s.bb_pct > BB_PCT_HIGH {
            return Vote::new(Direction::Short, format!("%B {:.2} at upper band on volume", s.bb_pct));
        }
    }
    Vote::neutral(format!("%B {:.2} vol x{:.2}", s.bb_pct, s.volume_ratio))
}

pub fn mtf_vote(s: &IndicatorSnapshot) -> Vote {
    let pullback = s.distance_to_ema20() < PULLBACK_PCT;
    if !pullback {
        return Vote::neutral("no pullback to EMA20");
    }
    if s.ema20_htf > s.ema50_htf && s.is_bullish() && s.rsi < MTF_RSI_LONG_MAX {
        Vote::new(Direction::Long, "HTF uptrend, pullback to EMA20, bullish bar")
    } else if s.ema20_htf < s.ema50_htf && s.is_bearish() && s.rsi > MTF_RSI_SHORT_MIN {
        Vote::new(Direction::Short, "HTF downtrend, pullback to EMA20, bearish bar")
    } else {
        Vote::neutral("pullback without HTF confirmation")
    }
}

pub fn vote_all(s: &IndicatorSnapshot) -> Vec<NamedVote> {
    vec![
        NamedVote { name: "trend", vote: trend_vote(s) },
        NamedVote { name: "momentum", vote: momentum_vote(s) },
        NamedVote { name: "volatility", vote: volatility_vote(s) },
        NamedVote { name: "mtf", vote: mtf_vote(s) },
    ]
}

/// Hourly four-vote engine.
#[derive(Debug, Default)]
pub struct VoteEngine;

impl SignalEngine for VoteEngine {
    fn name(&self) -> &'static str {
        "plan_a_vote"
    }

    fn entry_history(&self) -> usize {
        PLAN_A_MIN_HISTORY
    }

    fn filter_history(&self) -> Option<usize> {
        None
    }

    fn evaluate(&self, ctx: &MarketContext<'_>) -> Result<SignalReport, IndicatorError> {
        let snapshot = indicators::snapshot(ctx.entry_bars, PLAN_A_MIN_HISTORY)?;
        let signal = combine_votes(vote_all(&snapshot));
        Ok(SignalReport { signal, snapshot })
    }
}
