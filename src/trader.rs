//! Decision and monitoring loops around the single position.
//!
//! Both loops share one `TradingState` behind an async mutex. Every path that
//! opens or closes holds the lock across the exchange round-trip.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::config::{Config, StrategyKind};
use crate::exchange::{ExchangeError, MarketData, OrderExecution};
use crate::indicators::IndicatorError;
use crate::journal::{EquitySnapshot, JournalError, SignalRecord, TradeJournal};
use crate::position_manager::{LifecycleError, PositionBook, PriceAction};
use crate::risk_manager::{
    DenyReason, MarketConditions, RiskDecision, RiskManager, RiskState, SizingError, SpreadTracker,
};
use crate::strategy::{MarketContext, SignalEngine, SignalReport};
use crate::strategy_scalp::ScalpEngine;
use crate::strategy_vote::VoteEngine;
use crate::telegram::{NotifyEvent, Notifier};
use crate::types::{Balance, ClosedTrade, CombinedSignal, ExchangePosition, ExitReason, Position, Quote};

/// A live exchange position is not adopted this soon after a local exit, so a
/// lagging position read cannot resurrect a closed trade.
const ADOPT_GRACE_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum TraderError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// What a decision tick did. Journaled as the `decision` code.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    SkipInput(IndicatorError),
    Hold,
    Denied(DenyReason),
    SizingFailed(SizingError),
    Opened(Position),
    OpenFailed(String),
    Reversed(ClosedTrade),
}

impl TickOutcome {
    pub fn code(&self) -> String {
        match self {
            TickOutcome::SkipInput(_) => "SKIP_INPUT".into(),
            TickOutcome::Hold => "HOLD".into(),
            TickOutcome::Denied(reason) => format!("DENY_{}", reason),
            TickOutcome::SizingFailed(_) => "SIZING_FAILED".into(),
            TickOutcome::Opened(_) => "OPEN".into(),
            TickOutcome::OpenFailed(_) => "OPEN_FAILED".into(),
            TickOutcome::Reversed(_) => "REVERSE".into(),
        }
    }
}

/// What a monitoring tick did.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorOutcome {
    Flat,
    /// An untracked exchange position was imported and protected.
    Adopted(Position),
    Held,
    StopMoved(f64),
    Closed(ClosedTrade),
}

pub struct TradingState {
    pub book: PositionBook,
    pub risk: RiskState,
    pub spreads: SpreadTracker,
    pub last_exit_at: Option<DateTime<Utc>>,
}

/// Signal engine for the configured strategy.
pub fn build_engine(config: &Config) -> Box<dyn SignalEngine> {
    match config.strategy {
        StrategyKind::PlanA => Box::new(VoteEngine),
        StrategyKind::PlanB => Box::new(ScalpEngine::new(config.scalp.clone())),
    }
}

/// Delay until the next decision slot: interval boundaries plus a settle offset.
pub fn next_decision_delay(now: DateTime<Utc>, interval_secs: u64, settle_secs: u64) -> Duration {
    let interval = interval_secs.max(1) as i64;
    let settle = settle_secs as i64;
    let millis = now.timestamp_millis();
    let base = millis - settle * 1000;
    let next = (base.div_euclid(interval * 1000) + 1) * interval * 1000 + settle * 1000;
    Duration::from_millis((next - millis).max(0) as u64)
}

pub struct Trader {
    config: Config,
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderExecution>,
    notifier: Arc<dyn Notifier>,
    journal: Arc<dyn TradeJournal>,
    engine: Box<dyn SignalEngine>,
    risk: RiskManager,
    state: Mutex<TradingState>,
}

impl Trader {
    pub fn new(
        config: Config,
        market: Arc<dyn MarketData>,
        orders: Arc<dyn OrderExecution>,
        notifier: Arc<dyn Notifier>,
        journal: Arc<dyn TradeJournal>,
        engine: Box<dyn SignalEngine>,
        now: DateTime<Utc>,
    ) -> Self {
        let risk = RiskManager::new(config.risk.clone());
        let state = TradingState {
            book: PositionBook::new(config.symbol.clone(), config.exits.clone()),
            risk: RiskState::new(now, 0.0, &config.risk),
            spreads: SpreadTracker::default(),
            last_exit_at: None,
        };
        Trader { config, market, orders, notifier, journal, engine, risk, state: Mutex::new(state) }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Read access for status lines and tests.
    pub async fn with_state<R>(&self, f: impl FnOnce(&TradingState) -> R) -> R {
        let st = self.state.lock().await;
        f(&st)
    }

    fn entry_interval(&self) -> &str {
        match self.config.strategy {
            StrategyKind::PlanA => &self.config.interval,
            StrategyKind::PlanB => &self.config.scalp_entry_interval,
        }
    }

    fn journaled(&self, what: &str, result: Result<(), JournalError>) {
        if let Err(e) = result {
            log::warn!("JOURNAL: {} not written: {}", what, e);
        }
    }

    fn report_error(&self, now: DateTime<Utc>, context: &str, err: &dyn std::fmt::Display) {
        let message = err.to_string();
        log::error!("{}: {}", context, message);
        self.journaled("error", self.journal.record_error(now, context, &message));
        self.notifier.notify(NotifyEvent::Error(format!("{}: {}", context, message)));
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Seeds the risk state from the account and reconciles with the exchange.
    pub async fn startup(&self, now: DateTime<Utc>) -> Result<Balance, TraderError> {
        let balance = self.market.balance().await?;
        {
            let mut st = self.state.lock().await;
            st.risk = RiskState::new(now, balance.equity, &self.config.risk);
        }
        self.reconcile().await?;
        log::info!(
            "Trader started: {} | {} | equity {:.2} available {:.2}",
            self.config.symbol, self.engine.name(), balance.equity, balance.available
        );
        self.notifier.notify(NotifyEvent::Started {
            symbol: self.config.symbol.clone(),
            strategy: self.engine.name(),
            testnet: self.config.testnet,
            equity: balance.equity,
        });
        Ok(balance)
    }

    /// Imports a live exchange position the book does not know about.
    pub async fn reconcile(&self) -> Result<(), TraderError> {
        log::info!("Reconciling position with exchange...");
        let live = self.market.exchange_position(&self.config.symbol).await?;
        let mut st = self.state.lock().await;
        match (live, st.book.is_open()) {
            (Some(live), false) => {
                self.adopt_live(&mut st, &live).await?;
            }
            (Some(live), true) => {
                if let Some(local) = st.book.position() {
                    if (local.quantity - live.size).abs() > f64::EPSILON {
                        log::warn!("Size mismatch: local={} exchange={}", local.quantity, live.size);
                    }
                }
            }
            (None, _) => {}
        }
        log::info!("Position reconciliation complete (open: {}).", st.book.is_open());
        Ok(())
    }

    /// Tracks `live` in the book and restores missing server-side protection.
    async fn adopt_live(&self, st: &mut TradingState, live: &ExchangePosition) -> Result<Position, TraderError> {
        let pos = st.book.adopt(live, self.config.risk.leverage)?.clone();
        self.notifier.notify(NotifyEvent::RiskAlert(format!(
            "Orphan position adopted: {} {} @ {:.5}",
            pos.direction, pos.quantity, pos.entry_price
        )));
        if live.stop_loss <= 0.0 {
            if let Err(e) = self
                .orders
                .set_protective_orders(&self.config.symbol, pos.stop_loss_price, Some(pos.take_profit_price))
                .await
            {
                log::warn!("Adopt: protective orders not set: {}", e);
            }
        }
        Ok(pos)
    }

    /// Rolls the trading day over when `now` has crossed it.
    fn roll_day(&self, st: &mut TradingState, now: DateTime<Utc>, equity: f64) {
        if let Some(summary) = st.risk.refresh(now, equity, &self.config.risk) {
            self.notifier.notify(NotifyEvent::DailySummary(summary));
        }
    }

    // ── Decision tick ─────────────────────────────────────────────────────────

    /// Fetch, evaluate, gate, and possibly open or reverse.
    pub async fn decision_tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, TraderError> {
        let symbol = self.config.symbol.as_str();
        let limit = self.config.kline_limit.max(self.engine.entry_history());
        let entry_bars = self.market.fetch_bars(symbol, self.entry_interval(), limit).await?;
        let filter_bars = match self.engine.filter_history() {
            Some(n) => Some(
                self.market
                    .fetch_bars(symbol, &self.config.scalp_filter_interval, self.config.kline_limit.max(n))
                    .await?,
            ),
            None => None,
        };
        let quote = self.market.ticker(symbol).await?;
        let balance = self.market.balance().await?;

        let ctx = MarketContext { entry_bars: &entry_bars, filter_bars: filter_bars.as_deref(), quote: Some(quote) };
        let evaluated = self.engine.evaluate(&ctx);

        let mut st = self.state.lock().await;
        self.roll_day(&mut st, now, balance.equity);

        let report = match evaluated {
            Ok(report) => report,
            Err(e) => {
                log::warn!("SIGNAL: skipped, {}", e);
                let outcome = TickOutcome::SkipInput(e.clone());
                self.record_signal(now, quote.last, CombinedSignal::neutral(e.to_string()), None, &outcome);
                self.record_equity(now, &balance, &st, quote.last);
                return Ok(outcome);
            }
        };
        let SignalReport { signal, snapshot } = report;
        log::info!(
            "SIGNAL: {} conf {} | {} | close {:.5}",
            signal.direction, signal.confidence, signal.detail, snapshot.close
        );

        let outcome = self.act_on_signal(&mut st, &signal, snapshot.volume_ratio, quote, &balance, now).await;
        self.record_signal(now, quote.last, signal, Some(snapshot), &outcome);
        self.record_equity(now, &balance, &st, quote.last);
        Ok(outcome)
    }

    async fn act_on_signal(
        &self,
        st: &mut TradingState,
        signal: &CombinedSignal,
        volume_ratio: f64,
        quote: Quote,
        balance: &Balance,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        if !signal.is_directional() {
            return TickOutcome::Hold;
        }

        if let Some(reason) = st.book.on_signal_reverse(signal.direction) {
            return match self.close_position(st, reason, quote.last, now).await {
                Ok(trade) => TickOutcome::Reversed(trade),
                Err(_) => TickOutcome::Hold,
            };
        }

        let conditions = MarketConditions {
            volume_ratio,
            spread: Some(quote.spread()),
            avg_spread: st.spreads.average(),
        };
        if let RiskDecision::Deny(reason) = self.risk.evaluate(&st.risk, st.book.position(), signal, &conditions, now) {
            return TickOutcome::Denied(reason);
        }

        match self.open_position(st, signal, quote, balance, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_error(now, "open", &e);
                TickOutcome::OpenFailed(e.to_string())
            }
        }
    }

    async fn open_position(
        &self,
        st: &mut TradingState,
        signal: &CombinedSignal,
        quote: Quote,
        balance: &Balance,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, TraderError> {
        let symbol = self.config.symbol.as_str();
        let instrument = self.market.instrument(symbol).await?;
        let sizing = match self.risk.size_position(balance, quote.last, signal.confidence, &instrument) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("RISK: sizing failed: {}", e);
                return Ok(TickOutcome::SizingFailed(e));
            }
        };
        log::info!(
            "RISK: allow {} | size {:.1}% margin {:.2} notional {:.2} qty {}",
            signal.direction, sizing.size_pct, sizing.margin, sizing.notional, sizing.quantity
        );

        let mut fill = self
            .orders
            .open_position(symbol, signal.direction, sizing.quantity, sizing.leverage)
            .await?;
        if fill.price <= 0.0 {
            fill.price = quote.last;
        }
        let position = st.book.open(signal.direction, &sizing, &fill, now, signal.confidence)?.clone();

        if let Err(e) = self
            .orders
            .set_protective_orders(symbol, position.stop_loss_price, Some(position.take_profit_price))
            .await
        {
            log::warn!("Protective orders not set, monitoring locally: {}", e);
            self.notifier.notify(NotifyEvent::RiskAlert(format!("Server SL/TP not set: {}", e)));
        }
        self.notifier.notify(NotifyEvent::TradeOpened { symbol: symbol.to_string(), position: position.clone() });
        Ok(TickOutcome::Opened(position))
    }

    /// Market exit of the open position, then lifecycle close and journaling.
    /// `reference_price` stands in when the exchange reports no fill price.
    async fn close_position(
        &self,
        st: &mut TradingState,
        reason: ExitReason,
        reference_price: f64,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, TraderError> {
        let (direction, quantity) = match st.book.position() {
            Some(p) => (p.direction, p.quantity),
            None => return Err(LifecycleError::NoPosition.into()),
        };
        let fill = match self.orders.close_position(&self.config.symbol, direction, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                self.report_error(now, &format!("close {}", reason), &e);
                return Err(e.into());
            }
        };
        let price = if fill.price > 0.0 { fill.price } else { reference_price };
        self.finish_close(st, price, fill.fee, reason, now)
    }

    fn finish_close(
        &self,
        st: &mut TradingState,
        price: f64,
        fee: Option<f64>,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, TraderError> {
        if !st.book.is_open() {
            return Err(LifecycleError::NoPosition.into());
        }
        // a close after midnight belongs to the new day
        let equity = st.risk.day_start_equity + st.risk.realized_pnl_today;
        self.roll_day(st, now, equity);

        let cooldown_before = st.risk.cooldown_until;
        let trade = st.book.close(price, fee, now, reason, &mut st.risk, &self.config.risk)?;
        st.last_exit_at = Some(now);
        self.journaled("trade", self.journal.record_trade(&trade));
        self.notifier.notify(NotifyEvent::TradeClosed(trade.clone()));
        if let Some(until) = st.risk.cooldown_until {
            if cooldown_before != Some(until) {
                self.notifier.notify(NotifyEvent::RiskAlert(format!(
                    "{} consecutive stop-losses, entries paused until {}",
                    st.risk.consecutive_stop_losses,
                    until.format("%Y-%m-%d %H:%M UTC")
                )));
            }
        }
        Ok(trade)
    }

    fn record_signal(
        &self,
        now: DateTime<Utc>,
        price: f64,
        signal: CombinedSignal,
        indicators: Option<crate::indicators::IndicatorSnapshot>,
        outcome: &TickOutcome,
    ) {
        let record = SignalRecord {
            timestamp: now,
            symbol: self.config.symbol.clone(),
            strategy: self.engine.name(),
            price,
            signal,
            indicators,
            decision: outcome.code(),
        };
        self.journaled("signal", self.journal.record_signal(&record));
    }

    fn record_equity(&self, now: DateTime<Utc>, balance: &Balance, st: &TradingState, price: f64) {
        let snapshot = EquitySnapshot {
            timestamp: now,
            equity: balance.equity,
            available: balance.available,
            realized_pnl_today: st.risk.realized_pnl_today,
            trades_today: st.risk.trade_count_today,
            position: st.book.position().map(|p| p.direction),
            unrealized_pnl_pct: st.book.position().map(|p| p.pnl_pct(price)),
        };
        self.journaled("equity", self.journal.record_equity(&snapshot));
    }

    // ── Monitoring tick ───────────────────────────────────────────────────────

    /// Spread sampling, exchange sync and exit evaluation on the live price.
    pub async fn monitor_tick(&self, now: DateTime<Utc>) -> Result<MonitorOutcome, TraderError> {
        let symbol = self.config.symbol.as_str();
        let quote = self.market.ticker(symbol).await?;

        let mut st = self.state.lock().await;
        st.spreads.push(quote.spread());
        if !st.book.is_open() {
            return self.sync_flat(&mut st, now).await;
        }

        match self.market.exchange_position(symbol).await {
            Ok(None) => {
                if let Some(reason) = st.book.classify_server_exit(quote.last) {
                    log::warn!("Exchange reports no position, closing locally as {}", reason);
                    let trade = self.finish_close(&mut st, quote.last, None, reason, now)?;
                    return Ok(MonitorOutcome::Closed(trade));
                }
            }
            Ok(Some(_)) => {}
            Err(e) => log::warn!("Position sync failed, using local state: {}", e),
        }

        match st.book.on_price_update(quote.last, now) {
            PriceAction::Hold => Ok(MonitorOutcome::Held),
            PriceAction::Exit(reason) => {
                let trade = self.close_position(&mut st, reason, quote.last, now).await?;
                Ok(MonitorOutcome::Closed(trade))
            }
            PriceAction::MoveStop { price, kind } => {
                log::info!("{}: server stop -> {:.5}", kind.as_str(), price);
                if let Err(e) = self.orders.set_protective_orders(symbol, price, None).await {
                    log::warn!("Stop update failed, monitoring locally: {}", e);
                }
                Ok(MonitorOutcome::StopMoved(price))
            }
        }
    }

    /// While flat, picks up a position the exchange holds but the book does
    /// not, such as an order that filled after its request was reported failed.
    async fn sync_flat(&self, st: &mut TradingState, now: DateTime<Utc>) -> Result<MonitorOutcome, TraderError> {
        if let Some(at) = st.last_exit_at {
            if now - at < chrono::Duration::seconds(ADOPT_GRACE_SECS) {
                return Ok(MonitorOutcome::Flat);
            }
        }
        match self.market.exchange_position(&self.config.symbol).await {
            Ok(Some(live)) => {
                log::warn!("Exchange holds an untracked {} {}, adopting", live.direction, live.size);
                let pos = self.adopt_live(st, &live).await?;
                Ok(MonitorOutcome::Adopted(pos))
            }
            Ok(None) => Ok(MonitorOutcome::Flat),
            Err(e) => {
                log::debug!("Position sync failed while flat: {}", e);
                Ok(MonitorOutcome::Flat)
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Force-closes when configured, otherwise leaves server-side protection in place.
    pub async fn shutdown(&self, now: DateTime<Utc>) -> Option<ClosedTrade> {
        let mut st = self.state.lock().await;
        if !st.book.is_open() {
            self.notifier.notify(NotifyEvent::Stopped { position_left_open: false });
            return None;
        }
        if self.config.close_on_shutdown {
            let reference = match self.market.ticker(&self.config.symbol).await {
                Ok(q) => q.last,
                Err(_) => st.book.position().map(|p| p.entry_price).unwrap_or(0.0),
            };
            match self.close_position(&mut st, ExitReason::Shutdown, reference, now).await {
                Ok(trade) => {
                    self.notifier.notify(NotifyEvent::Stopped { position_left_open: false });
                    return Some(trade);
                }
                Err(e) => log::error!("Shutdown close failed: {}", e),
            }
        }
        log::warn!("Shutting down with an open position, server-side SL/TP remain");
        self.notifier.notify(NotifyEvent::Stopped { position_left_open: true });
        None
    }

    // ── Loops ─────────────────────────────────────────────────────────────────

    async fn decision_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = self.config.decision_interval_secs();
        loop {
            let delay = next_decision_delay(Utc::now(), interval, self.config.bar_settle_secs);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
            let now = Utc::now();
            match self.decision_tick(now).await {
                Ok(outcome) => log::info!("DECISION: {}", outcome.code()),
                Err(e) => self.report_error(now, "decision_tick", &e),
            }
            #[cfg(feature = "jemalloc")]
            crate::jemalloc_purge();
            if *stop.borrow() {
                break;
            }
        }
        log::info!("Decision loop stopped");
    }

    async fn monitor_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.monitor_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            let now = Utc::now();
            match self.monitor_tick(now).await {
                Ok(MonitorOutcome::Closed(trade)) => log::info!("MONITOR: closed {} ({})", trade.id, trade.exit_reason),
                Ok(MonitorOutcome::Adopted(pos)) => log::warn!("MONITOR: adopted {} {}", pos.direction, pos.quantity),
                Ok(_) => {}
                Err(e) => log::warn!("MONITOR: tick failed: {}", e),
            }
            if *stop.borrow() {
                break;
            }
        }
        log::info!("Monitor loop stopped");
    }

    /// Runs both loops until `stop` flips, then shuts down.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let decisions = tokio::spawn(self.clone().decision_loop(stop.clone()));
        let monitor = tokio::spawn(self.clone().monitor_loop(stop));
        for (name, handle) in [("decision", decisions), ("monitor", monitor)] {
            if let Err(e) = handle.await {
                log::error!("{} loop panicked: {}", name, e);
            }
        }
        self.shutdown(Utc::now()).await;
    }

    /// One decision tick and one monitoring pass, then return.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickOutcome, TraderError> {
        let outcome = self.decision_tick(now).await?;
        log::info!("DECISION: {}", outcome.code());
        if let Err(e) = self.monitor_tick(now).await {
            log::warn!("MONITOR: tick failed: {}", e);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hourly_slot_is_bar_close_plus_settle() {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 9, 59, 50).unwrap();
        assert_eq!(next_decision_delay(at, 3600, 10), Duration::from_secs(20));

        let inside_settle = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 5).unwrap();
        assert_eq!(next_decision_delay(inside_settle, 3600, 10), Duration::from_secs(5));

        let just_after = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 10).unwrap();
        assert_eq!(next_decision_delay(just_after, 3600, 10), Duration::from_secs(3600));
    }

    #[test]
    fn minute_slot_for_scalp() {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 30).unwrap();
        assert_eq!(next_decision_delay(at, 60, 10), Duration::from_secs(40));
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(TickOutcome::Denied(DenyReason::Cooldown).code(), "DENY_COOLDOWN");
        assert_eq!(
            TickOutcome::SkipInput(IndicatorError::InsufficientHistory { required: 200, available: 10 }).code(),
            "SKIP_INPUT"
        );
        assert_eq!(TickOutcome::Hold.code(), "HOLD");
    }

    #[test]
    fn engine_follows_strategy() {
        let mut config = crate::config::tests::sample();
        assert_eq!(build_engine(&config).name(), "plan_a_vote");
        config.strategy = StrategyKind::PlanB;
        assert_eq!(build_engine(&config).name(), "plan_b_scalp");
    }
}
