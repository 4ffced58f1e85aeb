use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{ExitParams, RiskParams};
use crate::risk_manager::{RiskState, Sizing};
use crate::types::{ClosedTrade, Direction, ExchangePosition, ExitReason, Fill, Position};

/// Float slack for percentage thresholds (103.95 from 105 is exactly -1 %).
const PCT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("a position is already open")]
    AlreadyOpen,
    #[error("no open position")]
    NoPosition,
    #[error("cannot open a neutral position")]
    NeutralDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMove {
    Trailing,
    /// `TIME_EXIT_BE`: stop ratcheted to entry, position stays open.
    Breakeven,
}

impl StopMove {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMove::Trailing => "TRAILING_UPDATE",
            StopMove::Breakeven => "TIME_EXIT_BE",
        }
    }
}

/// Outcome of one monitoring tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PriceAction {
    Hold,
    Exit(ExitReason),
    /// Push a new server-side stop.
    MoveStop { price: f64, kind: StopMove },
}

/// Stop and target prices for an entry, fee buffer included.
pub fn protective_prices(direction: Direction, entry: f64, exits: &ExitParams) -> (f64, f64) {
    let sign = direction.sign();
    let stop = entry * (1.0 - sign * exits.effective_sl_pct() / 100.0);
    let take = entry * (1.0 + sign * exits.effective_tp_pct() / 100.0);
    (stop, take)
}

pub fn trade_id(at: DateTime<Utc>) -> String {
    format!("T-{}", at.format("%Y%m%d-%H%M%S-%3f"))
}

/// Owner of the single position and its exit rules.
#[derive(Debug)]
pub struct PositionBook {
    symbol: String,
    exits: ExitParams,
    position: Option<Position>,
}

impl PositionBook {
    pub fn new(symbol: impl Into<String>, exits: ExitParams) -> Self {
        PositionBook { symbol: symbol.into(), exits, position: None }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn exits(&self) -> &ExitParams {
        &self.exits
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.position.is_some()
    }

    /// Flat -> Open from an exchange fill.
    pub fn open(
        &mut self,
        direction: Direction,
        sizing: &Sizing,
        fill: &Fill,
        time: DateTime<Utc>,
        confidence: u8,
    ) -> Result<&Position, LifecycleError> {
        if self.position.is_some() {
            return Err(LifecycleError::AlreadyOpen);
        }
        if direction == Direction::Neutral {
            return Err(LifecycleError::NeutralDirection);
        }
        let quantity = if fill.quantity > 0.0 { fill.quantity } else { sizing.quantity };
        let entry = fill.price;
        let (stop, take) = protective_prices(direction, entry, &self.exits);
        let entry_fee = fill.fee.unwrap_or(entry * quantity * self.exits.fee_rate);

        let pos = Position {
            id: trade_id(time),
            direction,
            entry_price: entry,
            quantity,
            leverage: sizing.leverage,
            entry_time: time,
            stop_loss_price: stop,
            initial_stop_loss_price: stop,
            take_profit_price: take,
            trailing_activated: false,
            trailing_high_water: entry,
            breakeven_applied: false,
            max_favorable_excursion_pct: 0.0,
            max_adverse_excursion_pct: 0.0,
            entry_fee,
            confidence,
        };
        log::info!(
            "POSITION_OPEN [{}]: {} {} qty={} @ {:.5} | SL {:.5} TP {:.5} | conf {}",
            self.symbol, pos.id, direction, quantity, entry, stop, take, confidence
        );
        Ok(&*self.position.insert(pos))
    }

    /// Imports a position found on the exchange with no local record.
    pub fn adopt(&mut self, live: &ExchangePosition, leverage: u32) -> Result<&Position, LifecycleError> {
        if self.position.is_some() {
            return Err(LifecycleError::AlreadyOpen);
        }
        if live.direction == Direction::Neutral {
            return Err(LifecycleError::NeutralDirection);
        }
        let (stop, take) = protective_prices(live.direction, live.avg_price, &self.exits);
        let stop = if live.stop_loss > 0.0 { live.stop_loss } else { stop };
        let take = if live.take_profit > 0.0 { live.take_profit } else { take };
        let pos = Position {
            id: trade_id(live.created_time),
            direction: live.direction,
            entry_price: live.avg_price,
            quantity: live.size,
            leverage,
            entry_time: live.created_time,
            stop_loss_price: stop,
            initial_stop_loss_price: stop,
            take_profit_price: take,
            trailing_activated: false,
            trailing_high_water: live.avg_price,
            breakeven_applied: false,
            max_favorable_excursion_pct: 0.0,
            max_adverse_excursion_pct: 0.0,
            entry_fee: live.avg_price * live.size * self.exits.fee_rate,
            confidence: 0,
        };
        log::warn!(
            "POSITION_ADOPT [{}]: {} size={} @ {:.5} | SL {:.5} TP {:.5}",
            self.symbol, live.direction, live.size, live.avg_price, stop, take
        );
        Ok(&*self.position.insert(pos))
    }

    /// Exit evaluation on a live price. Fixed priority: stop-loss,
    /// take-profit, trailing, time.
    pub fn on_price_update(&mut self, price: f64, now: DateTime<Utc>) -> PriceAction {
        let exits = &self.exits;
        let pos = match self.position.as_mut() {
            Some(p) => p,
            None => return PriceAction::Hold,
        };
        if !price.is_finite() || price <= 0.0 {
            return PriceAction::Hold;
        }

        let pnl = pos.pnl_pct(price);
        pos.max_favorable_excursion_pct = pos.max_favorable_excursion_pct.max(pnl);
        pos.max_adverse_excursion_pct = pos.max_adverse_excursion_pct.min(pnl);

        let long = pos.direction == Direction::Long;
        let sl_hit = if long { price <= pos.stop_loss_price } else { price >= pos.stop_loss_price };
        if sl_hit {
            return PriceAction::Exit(ExitReason::StopLoss);
        }
        let tp_hit = if long { price >= pos.take_profit_price } else { price <= pos.take_profit_price };
        if tp_hit {
            return PriceAction::Exit(ExitReason::TakeProfit);
        }

        let mut pending_move = None;
        if exits.trailing_enabled {
            let sign = pos.direction.sign();
            if !pos.trailing_activated && pnl + PCT_TOLERANCE >= exits.trailing_activate_pct {
                pos.trailing_activated = true;
                pos.trailing_high_water = price;
                pending_move = Some(price * (1.0 - sign * exits.trailing_callback_pct / 100.0));
                log::info!("TRAILING: armed at {:.5} (PnL {:+.2}%)", price, pnl);
            } else if pos.trailing_activated {
                let improved = if long { price > pos.trailing_high_water } else { price < pos.trailing_high_water };
                if improved {
                    pos.trailing_high_water = price;
                    pending_move = Some(price * (1.0 - sign * exits.trailing_callback_pct / 100.0));
                }
            }
            if pos.trailing_activated {
                let hw = pos.trailing_high_water;
                let retrace = (price - hw) / hw * 100.0 * sign;
                if retrace <= -exits.trailing_callback_pct + PCT_TOLERANCE {
                    return PriceAction::Exit(ExitReason::TrailingStop);
                }
            }
        }

        let held = now - pos.entry_time;
        if held >= exits.max_holding {
            return PriceAction::Exit(ExitReason::TimeExit);
        }

        if let Some(stop) = pending_move {
            return PriceAction::MoveStop { price: stop, kind: StopMove::Trailing };
        }

        if let Some(be) = exits.breakeven_after {
            if !pos.breakeven_applied && held >= be && pnl >= 0.0 {
                pos.breakeven_applied = true;
                let entry = pos.entry_price;
                let tighter = if long { entry > pos.stop_loss_price } else { entry < pos.stop_loss_price };
                if tighter {
                    pos.stop_loss_price = entry;
                }
                log::info!("TIME_EXIT_BE: stop moved to entry {:.5} after {}m", entry, held.num_minutes());
                return PriceAction::MoveStop { price: pos.stop_loss_price, kind: StopMove::Breakeven };
            }
        }

        PriceAction::Hold
    }

    /// `SIGNAL_REVERSE` when the new signal opposes the open side.
    pub fn on_signal_reverse(&self, signal: Direction) -> Option<ExitReason> {
        let pos = self.position.as_ref()?;
        (signal != Direction::Neutral && signal == pos.direction.opposite())
            .then_some(ExitReason::SignalReverse)
    }

    /// Reason for a position the exchange closed on its own, judged by price.
    pub fn classify_server_exit(&self, price: f64) -> Option<ExitReason> {
        let pos = self.position.as_ref()?;
        let pnl = pos.pnl_pct(price);
        Some(if pnl <= -self.exits.stop_loss_pct * 0.5 {
            ExitReason::ServerStopLoss
        } else if pnl >= self.exits.take_profit_pct * 0.5 {
            ExitReason::ServerTakeProfit
        } else {
            ExitReason::ServerClose
        })
    }

    /// Open -> Closed. Emits the trade record and folds it into the risk state.
    pub fn close(
        &mut self,
        exit_price: f64,
        exit_fee: Option<f64>,
        time: DateTime<Utc>,
        reason: ExitReason,
        risk: &mut RiskState,
        risk_params: &RiskParams,
    ) -> Result<ClosedTrade, LifecycleError> {
        let pos = self.position.take().ok_or(LifecycleError::NoPosition)?;
        let trade = settle(&self.symbol, &self.exits, pos, exit_price, exit_fee, time, reason);
        log::info!(
            "POSITION_CLOSE [{}]: {} {} {} @ {:.5} | net {:+.4} USDT ({:+.2}% margin) | R {:.2} | MFE {:.2}% MAE {:.2}%",
            self.symbol, trade.id, trade.direction, reason, exit_price, trade.net_pnl,
            trade.net_pnl_pct, trade.r_multiple, trade.mfe_pct, trade.mae_pct
        );
        risk.record_close(&trade, risk_params);
        Ok(trade)
    }
}

fn settle(
    symbol: &str,
    exits: &ExitParams,
    pos: Position,
    exit_price: f64,
    exit_fee: Option<f64>,
    time: DateTime<Utc>,
    reason: ExitReason,
) -> ClosedTrade {
    let sign = pos.direction.sign();
    let gross_pnl = (exit_price - pos.entry_price) * pos.quantity * sign;
    let pnl_pct = pos.pnl_pct(exit_price);
    let fee_exit = exit_fee.unwrap_or(exit_price * pos.quantity * exits.fee_rate);
    let fee_total = pos.entry_fee + fee_exit;
    let net_pnl = gross_pnl - fee_total;
    let margin = pos.margin();
    let net_pnl_pct = if margin > 0.0 { net_pnl / margin * 100.0 } else { 0.0 };
    let risk_per_unit = (pos.entry_price - pos.initial_stop_loss_price).abs();
    let r_multiple = if risk_per_unit > 0.0 && pos.quantity > 0.0 {
        net_pnl / pos.quantity / risk_per_unit
    } else {
        0.0
    };

    ClosedTrade {
        id: pos.id,
        symbol: symbol.to_string(),
        direction: pos.direction,
        entry_price: pos.entry_price,
        exit_price,
        quantity: pos.quantity,
        leverage: pos.leverage,
        entry_time: pos.entry_time,
        exit_time: time,
        exit_reason: reason,
        stop_loss_price: pos.stop_loss_price,
        take_profit_price: pos.take_profit_price,
        gross_pnl,
        pnl_pct,
        fee_entry: pos.entry_fee,
        fee_exit,
        fee_total,
        net_pnl,
        net_pnl_pct,
        mfe_pct: pos.max_favorable_excursion_pct.max(pnl_pct),
        mae_pct: pos.max_adverse_excursion_pct.min(pnl_pct),
        r_multiple,
        holding_secs: (time - pos.entry_time).num_seconds(),
        trailing_activated: pos.trailing_activated,
        confidence: pos.confidence,
    }
}
