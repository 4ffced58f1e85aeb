use crate::indicators::{IndicatorError, IndicatorSnapshot};
use crate::types::{Candle, CombinedSignal, Direction, NamedVote, Quote};

/// Highest confidence a signal can carry (four agreeing votes, or any scalp trigger).
pub const MAX_CONFIDENCE: u8 = 4;

/// Inputs for one decision tick.
pub struct MarketContext<'a> {
    /// Closed bars on the entry timeframe, oldest first.
    pub entry_bars: &'a [Candle],
    /// Closed bars on the trend-filter timeframe, when the engine uses one.
    pub filter_bars: Option<&'a [Candle]>,
    pub quote: Option<Quote>,
}

pub struct SignalReport {
    pub signal: CombinedSignal,
    pub snapshot: IndicatorSnapshot,
}

/// A strategy that turns market context into a combined directional signal.
/// Picked once at startup.
pub trait SignalEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bars to request on the entry timeframe.
    fn entry_history(&self) -> usize;

    /// Bars to request on the filter timeframe; `None` when unused.
    fn filter_history(&self) -> Option<usize>;

    fn evaluate(&self, ctx: &MarketContext<'_>) -> Result<SignalReport, IndicatorError>;
}

/// Majority with veto: a side wins with at least two votes and no dissent.
pub fn combine_votes(breakdown: Vec<NamedVote>) -> CombinedSignal {
    let long_votes = breakdown.iter().filter(|v| v.vote.direction == Direction::Long).count() as u8;
    let short_votes = breakdown.iter().filter(|v| v.vote.direction == Direction::Short).count() as u8;

    let (direction, confidence) = if long_votes >= 2 && short_votes == 0 {
        (Direction::Long, long_votes)
    } else if short_votes >= 2 && long_votes == 0 {
        (Direction::Short, short_votes)
    } else {
        (Direction::Neutral, 0)
    };

    let detail = breakdown
        .iter()
        .map(|v| format!("{}={}", v.name, v.vote.direction))
        .collect::<Vec<_>>()
        .join(" ");

    CombinedSignal {
        direction,
        confidence,
        long_votes,
        short_votes,
        breakdown,
        detail,
        suppressed: None,
    }
}
