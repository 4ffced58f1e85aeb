use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use chrono::{DateTime, Duration, TimeZone, Utc};

use xrp_trader::config::{Config, ExitParams, RiskParams, ScalpParams, StrategyKind};
use xrp_trader::exchange::{ExchangeError, MarketData, OrderExecution};
use xrp_trader::indicators::{IndicatorError, IndicatorSnapshot};
use xrp_trader::journal::{EquitySnapshot, JournalError, SignalRecord, TradeJournal};
use xrp_trader::risk_manager::DenyReason;
use xrp_trader::strategy::{MarketContext, SignalEngine, SignalReport};
use xrp_trader::telegram::{NotifyEvent, Notifier};
use xrp_trader::trader::{MonitorOutcome, TickOutcome, Trader};
use xrp_trader::types::{
    Balance, Candle, ClosedTrade, CombinedSignal, Direction, ExchangePosition, ExitReason, Fill, Instrument, Quote,
};

// ── Mocks ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockExchange {
    quote: Mutex<Option<Quote>>,
    position: Mutex<Option<ExchangePosition>>,
    fail_open: Mutex<bool>,
    /// The order fills but the call still reports an error.
    fail_after_fill: Mutex<bool>,
    stops: Mutex<Vec<f64>>,
    closes: Mutex<u32>,
}

impl MockExchange {
    fn set_price(&self, last: f64) {
        *self.quote.lock().unwrap() = Some(Quote { last, bid: last - 0.0001, ask: last + 0.0001 });
    }

    fn set_quote(&self, quote: Quote) {
        *self.quote.lock().unwrap() = Some(quote);
    }

    fn current(&self) -> Quote {
        self.quote.lock().unwrap().unwrap_or(Quote { last: 1.0, bid: 0.9999, ask: 1.0001 })
    }
}

#[async_trait]
impl MarketData for MockExchange {
    async fn fetch_bars(&self, _symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        Ok((0..limit as i64)
            .map(|i| Candle {
                timestamp: 1_700_000_000_000 + i * 3_600_000,
                open: 1.0,
                high: 1.01,
                low: 0.99,
                close: 1.0,
                volume: 1_000.0,
            })
            .collect())
    }

    async fn ticker(&self, _symbol: &str) -> Result<Quote, ExchangeError> {
        Ok(self.current())
    }

    async fn instrument(&self, _symbol: &str) -> Result<Instrument, ExchangeError> {
        Ok(Instrument { qty_step: 1.0, min_qty: 1.0, tick_size: 0.0001 })
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        Ok(Balance { equity: 1_000.0, available: 1_000.0 })
    }

    async fn exchange_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        Ok(self.position.lock().unwrap().clone())
    }
}

#[async_trait]
impl OrderExecution for MockExchange {
    async fn open_position(
        &self,
        _symbol: &str,
        direction: Direction,
        quantity: f64,
        _leverage: u32,
    ) -> Result<Fill, ExchangeError> {
        if *self.fail_open.lock().unwrap() {
            return Err(ExchangeError::Permanent { code: 110007, message: "insufficient balance".into() });
        }
        let price = self.current().last;
        *self.position.lock().unwrap() = Some(ExchangePosition {
            direction,
            size: quantity,
            avg_price: price,
            stop_loss: 0.0,
            take_profit: 0.0,
            created_time: Utc::now(),
        });
        if *self.fail_after_fill.lock().unwrap() {
            return Err(ExchangeError::DuplicateOrder("OrderLinkedID is duplicate".into()));
        }
        Ok(Fill { order_id: "open-1".into(), price, quantity, fee: Some(0.0) })
    }

    async fn close_position(&self, _symbol: &str, _direction: Direction, quantity: f64) -> Result<Fill, ExchangeError> {
        *self.position.lock().unwrap() = None;
        *self.closes.lock().unwrap() += 1;
        Ok(Fill { order_id: "close-1".into(), price: self.current().last, quantity, fee: Some(0.0) })
    }

    async fn set_protective_orders(
        &self,
        _symbol: &str,
        stop_loss: f64,
        _take_profit: Option<f64>,
    ) -> Result<(), ExchangeError> {
        self.stops.lock().unwrap().push(stop_loss);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct MemoryJournal {
    trades: Mutex<Vec<ClosedTrade>>,
    decisions: Mutex<Vec<String>>,
    equity: Mutex<Vec<EquitySnapshot>>,
    errors: Mutex<Vec<String>>,
}

impl TradeJournal for MemoryJournal {
    fn record_trade(&self, trade: &ClosedTrade) -> Result<(), JournalError> {
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }

    fn record_signal(&self, record: &SignalRecord) -> Result<(), JournalError> {
        self.decisions.lock().unwrap().push(record.decision.clone());
        Ok(())
    }

    fn record_equity(&self, snapshot: &EquitySnapshot) -> Result<(), JournalError> {
        self.equity.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    fn record_error(&self, _at: DateTime<Utc>, context: &str, message: &str) -> Result<(), JournalError> {
        self.errors.lock().unwrap().push(format!("{context}: {message}"));
        Ok(())
    }
}

/// Engine whose output the test sets directly.
struct ScriptedEngine(Arc<Mutex<Option<CombinedSignal>>>);

impl SignalEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn entry_history(&self) -> usize {
        50
    }

    fn filter_history(&self) -> Option<usize> {
        None
    }

    fn evaluate(&self, ctx: &MarketContext<'_>) -> Result<SignalReport, IndicatorError> {
        let signal = self.0.lock().unwrap().clone().ok_or(IndicatorError::InsufficientHistory {
            required: 200,
            available: ctx.entry_bars.len(),
        })?;
        let snapshot = IndicatorSnapshot { close: 1.0, volume_ratio: 1.0, ..Default::default() };
        Ok(SignalReport { signal, snapshot })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

fn signal(direction: Direction, confidence: u8) -> CombinedSignal {
    CombinedSignal {
        direction,
        confidence,
        long_votes: if direction == Direction::Long { confidence } else { 0 },
        short_votes: if direction == Direction::Short { confidence } else { 0 },
        breakdown: Vec::new(),
        detail: "scripted".into(),
        suppressed: None,
    }
}

fn config() -> Config {
    Config {
        symbol: "XRPUSDT".into(),
        testnet: true,
        api_key: "k".into(),
        api_secret: "s".into(),
        telegram_token: None,
        telegram_chat_id: None,
        strategy: StrategyKind::PlanA,
        interval: "60".into(),
        scalp_entry_interval: "5".into(),
        scalp_filter_interval: "15".into(),
        kline_limit: 300,
        risk: RiskParams { recent_sl_lookback: Duration::zero(), ..RiskParams::default() },
        exits: ExitParams { fee_rate: 0.0, ..ExitParams::plan_a() },
        scalp: ScalpParams::default(),
        close_on_shutdown: true,
        monitor_interval_secs: 10,
        scalp_signal_interval_secs: 60,
        bar_settle_secs: 10,
        log_dir: "./logs".into(),
    }
}

struct Harness {
    trader: Trader,
    exchange: Arc<MockExchange>,
    notifier: Arc<RecordingNotifier>,
    journal: Arc<MemoryJournal>,
    script: Arc<Mutex<Option<CombinedSignal>>>,
}

impl Harness {
    async fn start(config: Config) -> Self {
        let exchange = Arc::new(MockExchange::default());
        exchange.set_price(1.0);
        let notifier = Arc::new(RecordingNotifier::default());
        let journal = Arc::new(MemoryJournal::default());
        let script = Arc::new(Mutex::new(None));
        let trader = Trader::new(
            config,
            exchange.clone(),
            exchange.clone(),
            notifier.clone(),
            journal.clone(),
            Box::new(ScriptedEngine(script.clone())),
            t0(),
        );
        trader.startup(t0()).await.unwrap();
        Harness { trader, exchange, notifier, journal, script }
    }

    fn say(&self, s: Option<CombinedSignal>) {
        *self.script.lock().unwrap() = s;
    }

    async fn open_long(&self, at: DateTime<Utc>) {
        self.exchange.set_price(1.0);
        self.say(Some(signal(Direction::Long, 2)));
        let outcome = self.trader.decision_tick(at).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Opened(_)), "expected open, got {outcome:?}");
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 10).unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn long_signal_opens_with_server_protection() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;

    let pos = h.trader.with_state(|st| st.book.position().cloned()).await.unwrap();
    assert_eq!(pos.direction, Direction::Long);
    assert_eq!(pos.quantity, 50.0);
    assert!((pos.stop_loss_price - 0.98).abs() < 1e-9);
    assert_eq!(h.exchange.stops.lock().unwrap().len(), 1);
    assert_eq!(h.journal.decisions.lock().unwrap().as_slice(), ["OPEN"]);
    assert_eq!(h.journal.equity.lock().unwrap().last().unwrap().position, Some(Direction::Long));
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, NotifyEvent::TradeOpened { .. })));
}

#[tokio::test]
async fn second_signal_is_denied_while_open() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;
    let outcome = h.trader.decision_tick(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Denied(DenyReason::AlreadyInPosition));
    assert_eq!(h.journal.decisions.lock().unwrap().last().unwrap(), "DENY_ALREADY_IN_POSITION");
}

#[tokio::test]
async fn neutral_signal_holds_and_bad_input_skips() {
    let h = Harness::start(config()).await;
    h.say(Some(CombinedSignal::neutral("nothing")));
    assert_eq!(h.trader.decision_tick(t0()).await.unwrap(), TickOutcome::Hold);

    h.say(None);
    let outcome = h.trader.decision_tick(t0() + Duration::hours(1)).await.unwrap();
    assert!(matches!(outcome, TickOutcome::SkipInput(IndicatorError::InsufficientHistory { .. })));
    assert_eq!(h.journal.decisions.lock().unwrap().as_slice(), ["HOLD", "SKIP_INPUT"]);
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);
}

#[tokio::test]
async fn monitor_closes_on_stop_loss() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;

    h.exchange.set_price(0.995);
    assert_eq!(h.trader.monitor_tick(t0() + Duration::minutes(10)).await.unwrap(), MonitorOutcome::Held);

    h.exchange.set_price(0.979);
    let closed = h.trader.monitor_tick(t0() + Duration::minutes(20)).await.unwrap();
    let trade = match closed {
        MonitorOutcome::Closed(t) => t,
        other => panic!("expected close, got {other:?}"),
    };
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    assert!(trade.net_pnl < 0.0);
    assert_eq!(h.journal.trades.lock().unwrap().len(), 1);
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);
    assert_eq!(h.trader.with_state(|st| st.risk.consecutive_stop_losses).await, 1);
}

#[tokio::test]
async fn opposite_signal_reverses_out() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;

    h.exchange.set_price(1.01);
    h.say(Some(signal(Direction::Short, 3)));
    let outcome = h.trader.decision_tick(t0() + Duration::hours(1)).await.unwrap();
    match outcome {
        TickOutcome::Reversed(trade) => {
            assert_eq!(trade.exit_reason, ExitReason::SignalReverse);
            assert!((trade.net_pnl - 0.5).abs() < 1e-9);
        }
        other => panic!("expected reverse, got {other:?}"),
    }
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);
    assert_eq!(*h.exchange.closes.lock().unwrap(), 1);
}

#[tokio::test]
async fn three_stop_losses_arm_cooldown() {
    let h = Harness::start(config()).await;
    let mut at = t0();
    for _ in 0..3 {
        h.open_long(at).await;
        h.exchange.set_price(0.97);
        let out = h.trader.monitor_tick(at + Duration::minutes(5)).await.unwrap();
        assert!(matches!(out, MonitorOutcome::Closed(ref t) if t.exit_reason == ExitReason::StopLoss));
        at += Duration::minutes(30);
    }

    h.exchange.set_price(1.0);
    h.say(Some(signal(Direction::Long, 2)));
    assert_eq!(h.trader.decision_tick(at).await.unwrap(), TickOutcome::Denied(DenyReason::Cooldown));
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, NotifyEvent::RiskAlert(m) if m.contains("3 consecutive"))));

    // cooldown lapses two hours after the third stop
    let later = at + Duration::hours(2);
    assert!(matches!(h.trader.decision_tick(later).await.unwrap(), TickOutcome::Opened(_)));
}

#[tokio::test]
async fn wide_spread_blocks_entry() {
    let h = Harness::start(config()).await;
    for i in 0..5 {
        h.trader.monitor_tick(t0() + Duration::seconds(10 * i)).await.unwrap();
    }
    h.exchange.set_quote(Quote { last: 1.0, bid: 0.999, ask: 1.001 });
    h.say(Some(signal(Direction::Long, 2)));
    assert_eq!(
        h.trader.decision_tick(t0() + Duration::minutes(1)).await.unwrap(),
        TickOutcome::Denied(DenyReason::WideSpread)
    );
}

#[tokio::test]
async fn failed_open_stays_flat() {
    let h = Harness::start(config()).await;
    *h.exchange.fail_open.lock().unwrap() = true;
    h.say(Some(signal(Direction::Short, 2)));
    let outcome = h.trader.decision_tick(t0()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::OpenFailed(_)));
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);
    assert_eq!(h.journal.errors.lock().unwrap().len(), 1);
    assert_eq!(h.journal.decisions.lock().unwrap().as_slice(), ["OPEN_FAILED"]);
}

#[tokio::test]
async fn exchange_side_exit_is_detected() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;

    // the server stop fired between ticks
    *h.exchange.position.lock().unwrap() = None;
    h.exchange.set_price(0.979);
    let out = h.trader.monitor_tick(t0() + Duration::minutes(30)).await.unwrap();
    match out {
        MonitorOutcome::Closed(t) => assert_eq!(t.exit_reason, ExitReason::ServerStopLoss),
        other => panic!("expected server close, got {other:?}"),
    }
    assert_eq!(*h.exchange.closes.lock().unwrap(), 0);
    assert_eq!(h.trader.with_state(|st| st.risk.consecutive_stop_losses).await, 1);
}

#[tokio::test]
async fn trailing_moves_server_stop() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;

    // +3.6 % arms the 3.5 % trailing stop below the 4 % target
    h.exchange.set_price(1.036);
    let out = h.trader.monitor_tick(t0() + Duration::minutes(10)).await.unwrap();
    match out {
        MonitorOutcome::StopMoved(stop) => assert!((stop - 1.036 * 0.98).abs() < 1e-9),
        other => panic!("expected trailing update, got {other:?}"),
    }
    let stops = h.exchange.stops.lock().unwrap().clone();
    assert_eq!(stops.len(), 2);
}

#[tokio::test]
async fn shutdown_force_closes_when_configured() {
    let h = Harness::start(config()).await;
    h.open_long(t0()).await;
    let trade = h.trader.shutdown(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(trade.exit_reason, ExitReason::Shutdown);
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);
}

#[tokio::test]
async fn shutdown_leaves_position_when_not_configured() {
    let mut cfg = config();
    cfg.close_on_shutdown = false;
    let h = Harness::start(cfg).await;
    h.open_long(t0()).await;
    assert!(h.trader.shutdown(t0() + Duration::hours(1)).await.is_none());
    assert!(h.trader.with_state(|st| st.book.is_open()).await);
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, NotifyEvent::Stopped { position_left_open: true })));
}

#[tokio::test]
async fn orphan_position_is_adopted_on_startup() {
    let exchange = Arc::new(MockExchange::default());
    exchange.set_price(1.0);
    *exchange.position.lock().unwrap() = Some(ExchangePosition {
        direction: Direction::Short,
        size: 80.0,
        avg_price: 1.02,
        stop_loss: 0.0,
        take_profit: 0.0,
        created_time: t0() - Duration::hours(2),
    });
    let trader = Trader::new(
        config(),
        exchange.clone(),
        exchange.clone(),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryJournal::default()),
        Box::new(ScriptedEngine(Arc::new(Mutex::new(None)))),
        t0(),
    );
    trader.startup(t0()).await.unwrap();

    let pos = trader.with_state(|st| st.book.position().cloned()).await.unwrap();
    assert_eq!(pos.direction, Direction::Short);
    assert_eq!(pos.quantity, 80.0);
    assert!((pos.stop_loss_price - 1.02 * 1.02).abs() < 1e-9);
    // missing server protection is restored
    assert_eq!(exchange.stops.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn fill_reported_as_failure_is_adopted_by_monitor() {
    let h = Harness::start(config()).await;
    *h.exchange.fail_after_fill.lock().unwrap() = true;
    h.say(Some(signal(Direction::Long, 2)));
    assert!(matches!(h.trader.decision_tick(t0()).await.unwrap(), TickOutcome::OpenFailed(_)));
    assert!(h.trader.with_state(|st| !st.book.is_open()).await);

    let out = h.trader.monitor_tick(t0() + Duration::seconds(10)).await.unwrap();
    match out {
        MonitorOutcome::Adopted(pos) => {
            assert_eq!(pos.direction, Direction::Long);
            assert_eq!(pos.quantity, 50.0);
        }
        other => panic!("expected adoption, got {other:?}"),
    }
    assert!(h.trader.with_state(|st| st.book.is_open()).await);
    let stops = h.exchange.stops.lock().unwrap().clone();
    assert_eq!(stops.len(), 1);
    assert!((stops[0] - 0.98).abs() < 1e-9);
}

#[tokio::test]
async fn exit_after_midnight_counts_for_the_new_day() {
    let mut cfg = config();
    cfg.risk.max_daily_trades = 1;
    let h = Harness::start(cfg).await;
    let before_midnight = Utc.with_ymd_and_hms(2025, 3, 10, 23, 59, 50).unwrap();
    h.open_long(before_midnight).await;

    h.exchange.set_price(0.97);
    let out = h.trader.monitor_tick(before_midnight + Duration::seconds(12)).await.unwrap();
    assert!(matches!(out, MonitorOutcome::Closed(ref t) if t.exit_reason == ExitReason::StopLoss));
    let (day, trades, pnl) = h
        .trader
        .with_state(|st| (st.risk.trading_day, st.risk.trade_count_today, st.risk.realized_pnl_today))
        .await;
    assert_eq!(day, chrono::NaiveDate::from_ymd_opt(2025, 3, 11).unwrap());
    assert_eq!(trades, 1);
    assert!(pnl < 0.0);
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, NotifyEvent::DailySummary(s) if s.trades == 0)));

    h.exchange.set_price(1.0);
    h.say(Some(signal(Direction::Long, 2)));
    assert_eq!(
        h.trader.decision_tick(before_midnight + Duration::seconds(20)).await.unwrap(),
        TickOutcome::Denied(DenyReason::DailyTradeLimitReached)
    );
}

async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loops_share_one_position_until_stopped() {
    let mut cfg = config();
    cfg.strategy = StrategyKind::PlanB;
    cfg.scalp_signal_interval_secs = 1;
    cfg.bar_settle_secs = 0;
    cfg.monitor_interval_secs = 1;
    cfg.risk.max_daily_trades = 1;
    let h = Harness::start(cfg).await;
    h.say(Some(signal(Direction::Long, 2)));
    let Harness { trader, exchange, journal, .. } = h;
    let trader = Arc::new(trader);

    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(trader.clone().run(stop_rx));

    let decided = |code: &str| journal.decisions.lock().unwrap().iter().any(|d| d == code);
    assert!(eventually(|| decided("OPEN")).await, "no entry");
    exchange.set_price(0.97);
    assert!(eventually(|| journal.trades.lock().unwrap().len() == 1).await, "no stop-loss exit");
    assert!(eventually(|| decided("DENY_DAILY_TRADE_LIMIT")).await, "no decision after the exit");

    stop_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), running)
        .await
        .expect("loops did not stop")
        .unwrap();

    let opens = journal.decisions.lock().unwrap().iter().filter(|d| *d == "OPEN").count();
    assert_eq!(opens, 1);
    assert_eq!(journal.trades.lock().unwrap().len(), 1);
    assert_eq!(*exchange.closes.lock().unwrap(), 1);
    assert!(trader.with_state(|st| !st.book.is_open()).await);
}
