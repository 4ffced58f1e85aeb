use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, unix milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }

    /// +1 for Long, -1 for Short, 0 for Neutral.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    /// Bybit order side.
    pub fn side(self) -> &'static str {
        match self {
            Direction::Long => "Buy",
            Direction::Short => "Sell",
            Direction::Neutral => "None",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub direction: Direction,
    pub rationale: String,
}

impl Vote {
    pub fn new(direction: Direction, rationale: impl Into<String>) -> Self {
        Vote { direction, rationale: rationale.into() }
    }

    pub fn neutral(rationale: impl Into<String>) -> Self {
        Vote::new(Direction::Neutral, rationale)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NamedVote {
    pub name: &'static str,
    #[serde(flatten)]
    pub vote: Vote,
}

/// Why a directional trigger was withheld.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suppression {
    /// Trend filter said no trade.
    NoTrend,
    /// Chop regime (low ADX and narrow bands).
    Regime,
    /// Live spread above the configured fraction.
    Spread,
}

/// Output of a signal engine, recomputed every decision tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CombinedSignal {
    pub direction: Direction,
    pub confidence: u8,
    pub long_votes: u8,
    pub short_votes: u8,
    pub breakdown: Vec<NamedVote>,
    pub detail: String,
    pub suppressed: Option<Suppression>,
}

impl CombinedSignal {
    pub fn neutral(detail: impl Into<String>) -> Self {
        CombinedSignal {
            direction: Direction::Neutral,
            confidence: 0,
            long_votes: 0,
            short_votes: 0,
            breakdown: Vec::new(),
            detail: detail.into(),
            suppressed: None,
        }
    }

    pub fn is_directional(&self) -> bool {
        self.direction != Direction::Neutral
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }

    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }
}

/// Execution report returned by the exchange for a market order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
    /// Fee charged, when the exchange reported it.
    pub fee: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub qty_step: f64,
    pub min_qty: f64,
    pub tick_size: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub equity: f64,
    pub available: f64,
}

/// Live position as the exchange reports it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangePosition {
    pub direction: Direction,
    pub size: f64,
    pub avg_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub created_time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "SL_HIT")]
    StopLoss,
    #[serde(rename = "TP_HIT")]
    TakeProfit,
    #[serde(rename = "TRAILING_STOP")]
    TrailingStop,
    #[serde(rename = "SIGNAL_REVERSE")]
    SignalReverse,
    #[serde(rename = "TIME_EXIT")]
    TimeExit,
    #[serde(rename = "SERVER_SL")]
    ServerStopLoss,
    #[serde(rename = "SERVER_TP")]
    ServerTakeProfit,
    #[serde(rename = "SERVER_CLOSE")]
    ServerClose,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "SL_HIT",
            ExitReason::TakeProfit => "TP_HIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::SignalReverse => "SIGNAL_REVERSE",
            ExitReason::TimeExit => "TIME_EXIT",
            ExitReason::ServerStopLoss => "SERVER_SL",
            ExitReason::ServerTakeProfit => "SERVER_TP",
            ExitReason::ServerClose => "SERVER_CLOSE",
            ExitReason::Shutdown => "SHUTDOWN",
        }
    }

    /// Exits that count toward the consecutive stop-loss streak.
    pub fn is_stop_loss(&self) -> bool {
        matches!(self, ExitReason::StopLoss | ExitReason::ServerStopLoss)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single open position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: f64,
    /// Stop at entry, before any breakeven ratchet; the R-multiple denominator.
    pub initial_stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_activated: bool,
    pub trailing_high_water: f64,
    pub breakeven_applied: bool,
    /// Best unrealized move seen, percent of entry.
    pub max_favorable_excursion_pct: f64,
    /// Worst unrealized move seen, percent of entry (<= 0).
    pub max_adverse_excursion_pct: f64,
    pub entry_fee: f64,
    pub confidence: u8,
}

impl Position {
    /// Unrealized move in percent of entry, signed by direction.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0 * self.direction.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn margin(&self) -> f64 {
        self.notional() / self.leverage.max(1) as f64
    }
}

/// Immutable record of a finished position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub gross_pnl: f64,
    pub pnl_pct: f64,
    pub fee_entry: f64,
    pub fee_exit: f64,
    pub fee_total: f64,
    pub net_pnl: f64,
    /// Net PnL as percent of margin.
    pub net_pnl_pct: f64,
    pub mfe_pct: f64,
    pub mae_pct: f64,
    pub r_multiple: f64,
    pub holding_secs: i64,
    pub trailing_activated: bool,
    pub confidence: u8,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.net_pnl > 0.0
    }
}
