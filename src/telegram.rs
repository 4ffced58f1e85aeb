use crate::config::Config;
use crate::risk_manager::DailySummary;
use crate::types::{ClosedTrade, Direction, Position};

const BASE_URL: &str = "https://api.telegram.org";

/// Operator-facing events.
#[derive(Clone, Debug)]
pub enum NotifyEvent {
    Started { symbol: String, strategy: &'static str, testnet: bool, equity: f64 },
    TradeOpened { symbol: String, position: Position },
    TradeClosed(ClosedTrade),
    RiskAlert(String),
    DailySummary(DailySummary),
    Error(String),
    Stopped { position_left_open: bool },
}

/// Fire-and-forget sink. Delivery failures are logged, never returned.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Used when no Telegram credentials are configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: NotifyEvent) {
        log::info!("NOTIFY: {}", render(&event).replace('\n', " | "));
    }
}

fn side_emoji(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "🟢",
        Direction::Short => "🔴",
        Direction::Neutral => "⚪",
    }
}

/// HTML body for an event.
pub fn render(event: &NotifyEvent) -> String {
    match event {
        NotifyEvent::Started { symbol, strategy, testnet, equity } => {
            let net = if *testnet { "testnet" } else { "mainnet" };
            format!(
                "🤖 <b>Trader started</b>\nPair: {symbol} | Strategy: {strategy} | {net}\n\
                 Equity: <code>{equity:.2} USDT</code>"
            )
        }
        NotifyEvent::TradeOpened { symbol, position: p } => format!(
            "{} <b>Trade Opened: {} {}</b>\n\
             Qty:    <code>{}</code>  Lev: <code>{}x</code>\n\
             Entry:  <code>{:.5}</code>\n\
             SL:     <code>{:.5}</code>\n\
             TP:     <code>{:.5}</code>\n\
             Conf:   <code>{}</code>",
            side_emoji(p.direction), p.direction, symbol, p.quantity, p.leverage,
            p.entry_price, p.stop_loss_price, p.take_profit_price, p.confidence
        ),
        NotifyEvent::TradeClosed(t) => {
            let emoji = if t.net_pnl >= 0.0 { "✅" } else { "❌" };
            format!(
                "{emoji} <b>Trade Closed: {} {}</b>\n\
                 Entry: <code>{:.5}</code>  Exit: <code>{:.5}</code>\n\
                 PnL:   <code>{:+.4} USDT</code> (<code>{:+.2}%</code> margin)\n\
                 R:     <code>{:.2}</code>  Held: <code>{}m</code>\n\
                 Reason: {}",
                t.direction, t.symbol, t.entry_price, t.exit_price, t.net_pnl, t.net_pnl_pct,
                t.r_multiple, t.holding_secs / 60, t.exit_reason
            )
        }
        NotifyEvent::RiskAlert(message) => format!("⚠️ <b>Risk Alert</b>\n{message}"),
        NotifyEvent::DailySummary(s) => {
            let win_rate = if s.trades > 0 { s.wins as f64 / s.trades as f64 * 100.0 } else { 0.0 };
            format!(
                "📊 <b>Daily Summary {}</b>\n\
                 PnL:      <code>{:+.2} USDT</code>\n\
                 Trades:   <code>{}</code>  Wins: <code>{}</code>  WR: <code>{:.1}%</code>\n\
                 Equity:   <code>{:.2} USDT</code>",
                s.day, s.realized_pnl, s.trades, s.wins, win_rate, s.equity
            )
        }
        NotifyEvent::Error(message) => format!("🛑 <b>Error</b>\n<code>{message}</code>"),
        NotifyEvent::Stopped { position_left_open } => {
            if *position_left_open {
                "⏹ <b>Trader stopped</b>\nPosition left open with server-side SL/TP".to_string()
            } else {
                "⏹ <b>Trader stopped</b>".to_string()
            }
        }
    }
}

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramBot {
    pub fn new(token: &str, chat_id: &str) -> Self {
        TelegramBot {
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", BASE_URL, token),
            chat_id: chat_id.to_string(),
        }
    }

    /// `None` unless both token and chat id are configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        match (&config.telegram_token, &config.telegram_chat_id) {
            (Some(token), Some(chat)) => Some(Self::new(token, chat)),
            _ => None,
        }
    }

    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }
}

impl Notifier for TelegramBot {
    fn notify(&self, event: NotifyEvent) {
        let bot = self.clone();
        let text = render(&event);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { bot.send(&text).await });
            }
            Err(_) => log::warn!("Telegram: no runtime, dropped: {}", text.replace('\n', " ")),
        }
    }
}
