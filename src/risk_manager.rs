use std::collections::VecDeque;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{RiskParams, AVAILABLE_BALANCE_CAP, SPREAD_SAMPLE_WINDOW};
use crate::types::{Balance, ClosedTrade, CombinedSignal, Instrument, Position};

// ── State ─────────────────────────────────────────────────────────────────────

/// Per-day counters. Mutated only by `record_close` and `refresh`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskState {
    pub trading_day: NaiveDate,
    pub day_start_equity: f64,
    /// Net realized PnL today, USDT.
    pub realized_pnl_today: f64,
    pub trade_count_today: u32,
    pub wins_today: u32,
    pub consecutive_stop_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_stop_loss_at: Option<DateTime<Utc>>,
}

/// Totals of a finished trading day.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailySummary {
    pub day: NaiveDate,
    pub realized_pnl: f64,
    pub trades: u32,
    pub wins: u32,
    pub equity: f64,
}

/// Calendar day at the configured offset from UTC.
pub fn trading_day(now: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    (now + Duration::hours(offset_hours as i64)).date_naive()
}

impl RiskState {
    pub fn new(now: DateTime<Utc>, equity: f64, params: &RiskParams) -> Self {
        RiskState {
            trading_day: trading_day(now, params.day_offset_hours),
            day_start_equity: equity,
            realized_pnl_today: 0.0,
            trade_count_today: 0,
            wins_today: 0,
            consecutive_stop_losses: 0,
            cooldown_until: None,
            last_stop_loss_at: None,
        }
    }

    /// Day rollover and cooldown expiry. Returns the closed day's totals on rollover.
    pub fn refresh(&mut self, now: DateTime<Utc>, equity: f64, params: &RiskParams) -> Option<DailySummary> {
        if let Some(until) = self.cooldown_until {
            if now >= until {
                log::info!("RISK: cooldown expired, stop-loss streak {} cleared", self.consecutive_stop_losses);
                self.cooldown_until = None;
                self.consecutive_stop_losses = 0;
            }
        }

        let today = trading_day(now, params.day_offset_hours);
        if today == self.trading_day {
            return None;
        }
        let summary = DailySummary {
            day: self.trading_day,
            realized_pnl: self.realized_pnl_today,
            trades: self.trade_count_today,
            wins: self.wins_today,
            equity,
        };
        log::info!(
            "RISK: day rollover {} -> {} | PnL {:+.4} | trades {} | equity {:.2}",
            self.trading_day, today, summary.realized_pnl, summary.trades, equity
        );
        *self = RiskState::new(now, equity, params);
        Some(summary)
    }

    /// Folds a closed trade into the day's counters and the stop-loss streak.
    pub fn record_close(&mut self, trade: &ClosedTrade, params: &RiskParams) {
        self.trade_count_today += 1;
        self.realized_pnl_today += trade.net_pnl;
        if trade.is_win() {
            self.wins_today += 1;
        }

        if trade.exit_reason.is_stop_loss() {
            self.consecutive_stop_losses += 1;
            self.last_stop_loss_at = Some(trade.exit_time);
            if self.consecutive_stop_losses >= params.cooldown_after_sl_streak {
                let until = trade.exit_time + params.cooldown;
                self.cooldown_until = Some(until);
                log::warn!(
                    "RISK: {} consecutive stop-losses, cooldown until {}",
                    self.consecutive_stop_losses, until
                );
            }
        } else {
            self.consecutive_stop_losses = 0;
        }

        log::info!(
            "RISK: trade {} recorded | day PnL {:+.4} | trades {} | SL streak {}",
            trade.id, self.realized_pnl_today, self.trade_count_today, self.consecutive_stop_losses
        );
    }

    pub fn daily_loss_limit(&self, params: &RiskParams) -> f64 {
        -params.max_daily_loss_pct / 100.0 * self.day_start_equity
    }
}

// ── Decision ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DenyReason {
    AlreadyInPosition,
    DailyLossLimitReached,
    DailyTradeLimitReached,
    Cooldown,
    RecentStopLoss,
    LowLiquidity,
    WideSpread,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::AlreadyInPosition => "ALREADY_IN_POSITION",
            DenyReason::DailyLossLimitReached => "DAILY_LOSS_LIMIT",
            DenyReason::DailyTradeLimitReached => "DAILY_TRADE_LIMIT",
            DenyReason::Cooldown => "COOLDOWN",
            DenyReason::RecentStopLoss => "RECENT_SL",
            DenyReason::LowLiquidity => "LOW_LIQUIDITY",
            DenyReason::WideSpread => "WIDE_SPREAD",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskDecision {
    Allow,
    Deny(DenyReason),
}

/// Market-microstructure inputs for the liquidity and spread checks.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarketConditions {
    pub volume_ratio: f64,
    pub spread: Option<f64>,
    pub avg_spread: Option<f64>,
}

/// Trailing window of observed bid/ask spreads.
#[derive(Debug)]
pub struct SpreadTracker {
    samples: VecDeque<f64>,
    cap: usize,
}

impl Default for SpreadTracker {
    fn default() -> Self {
        SpreadTracker::new(SPREAD_SAMPLE_WINDOW)
    }
}

impl SpreadTracker {
    pub fn new(cap: usize) -> Self {
        SpreadTracker { samples: VecDeque::with_capacity(cap), cap: cap.max(1) }
    }

    pub fn push(&mut self, spread: f64) {
        if !spread.is_finite() || spread < 0.0 {
            return;
        }
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(spread);
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sizing {
    pub size_pct: f64,
    pub margin: f64,
    pub notional: f64,
    pub quantity: f64,
    pub leverage: u32,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("no equity to size against ({0:.4})")]
    NoEquity(f64),
    #[error("invalid price {0}")]
    BadPrice(f64),
    #[error("quantity {quantity} below exchange minimum {min_qty}")]
    BelowMinQty { quantity: f64, min_qty: f64 },
}

/// Hard-limit arbiter and position sizer.
#[derive(Clone, Debug)]
pub struct RiskManager {
    params: RiskParams,
}

impl RiskManager {
    pub fn new(params: RiskParams) -> Self {
        RiskManager { params }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    /// Checks a directional signal against the hard limits, first match wins.
    /// Never mutates state.
    pub fn evaluate(
        &self,
        state: &RiskState,
        position: Option<&Position>,
        signal: &CombinedSignal,
        market: &MarketConditions,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        let p = &self.params;
        let deny = |reason: DenyReason| {
            log::info!("RISK: deny {} for {} signal", reason, signal.direction);
            RiskDecision::Deny(reason)
        };

        if position.is_some() {
            return deny(DenyReason::AlreadyInPosition);
        }
        if p.enforce_daily_loss_limit
            && state.day_start_equity > 0.0
            && state.realized_pnl_today <= state.daily_loss_limit(p)
        {
            return deny(DenyReason::DailyLossLimitReached);
        }
        if state.trade_count_today >= p.max_daily_trades {
            return deny(DenyReason::DailyTradeLimitReached);
        }
        if let Some(until) = state.cooldown_until {
            if now < until {
                return deny(DenyReason::Cooldown);
            }
        }
        if let Some(at) = state.last_stop_loss_at {
            if now - at < p.recent_sl_lookback {
                return deny(DenyReason::RecentStopLoss);
            }
        }
        if market.volume_ratio < p.min_volume_ratio {
            return deny(DenyReason::LowLiquidity);
        }
        if let (Some(spread), Some(avg)) = (market.spread, market.avg_spread) {
            if avg > 0.0 && spread > avg * p.max_spread_multiplier {
                return deny(DenyReason::WideSpread);
            }
        }
        RiskDecision::Allow
    }

    /// Margin from equity share (escalated at high confidence, capped), then
    /// quantity floored to the instrument step.
    pub fn size_position(
        &self,
        balance: &Balance,
        price: f64,
        confidence: u8,
        instrument: &Instrument,
    ) -> Result<Sizing, SizingError> {
        let p = &self.params;
        if !balance.equity.is_finite() || balance.equity <= 0.0 {
            return Err(SizingError::NoEquity(balance.equity));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(SizingError::BadPrice(price));
        }

        let size_pct = if confidence >= p.high_confidence_threshold {
            p.high_confidence_size_pct
        } else {
            p.position_size_pct
        }
        .min(p.max_position_size_pct);

        let margin = (balance.equity * size_pct / 100.0).min(balance.available.max(0.0) * AVAILABLE_BALANCE_CAP);
        let leverage = p.leverage.max(1);
        let notional = margin * leverage as f64;
        let quantity = floor_to_step(notional / price, instrument.qty_step);

        if quantity <= 0.0 || quantity < instrument.min_qty {
            return Err(SizingError::BelowMinQty { quantity, min_qty: instrument.min_qty });
        }
        Ok(Sizing { size_pct, margin, notional, quantity, leverage })
    }
}

/// Floors `qty` to a multiple of `step`, tolerant of float noise.
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    let steps = (qty / step + 1e-9).floor();
    let decimals = step_decimals(step);
    let scale = 10f64.powi(decimals as i32);
    (steps * step * scale).round() / scale
}

/// Decimal places implied by a step size (0.1 -> 1, 1 -> 0).
pub fn step_decimals(step: f64) -> usize {
    let mut d = 0;
    let mut s = step;
    while d < 10 && (s - s.round()).abs() > 1e-9 {
        s *= 10.0;
        d += 1;
    }
    d
}
