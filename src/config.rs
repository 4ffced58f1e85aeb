use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

// ─── Bybit V5 ─────────────────────────────────────────────────────────────────
pub const BYBIT_MAINNET_URL: &str = "https://api.bybit.com";
pub const BYBIT_TESTNET_URL: &str = "https://api-testnet.bybit.com";
pub const CATEGORY: &str = "linear";
// BYBIT_API_KEY, BYBIT_API_SECRET, TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime (see .env.example)

pub const DEFAULT_SYMBOL: &str = "XRPUSDT";
pub const KLINE_LIMIT: usize = 300;
pub const TAKER_FEE_RATE: f64 = 0.00055;

// ─── Sizing & leverage ────────────────────────────────────────────────────────
pub const LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 5;
pub const POSITION_SIZE_PCT: f64 = 5.0;
pub const HIGH_CONFIDENCE_SIZE_PCT: f64 = 8.0;
pub const MAX_POSITION_SIZE_PCT: f64 = 10.0;
/// Share of the available balance that may be committed as margin.
pub const AVAILABLE_BALANCE_CAP: f64 = 0.95;

// ─── Daily limits ─────────────────────────────────────────────────────────────
pub const MAX_DAILY_LOSS_PCT: f64 = 3.0;
pub const MAX_DAILY_TRADES: u32 = 5;
pub const COOLDOWN_AFTER_SL_STREAK: u32 = 3;
pub const COOLDOWN_HOURS: i64 = 2;
pub const RECENT_SL_LOOKBACK_HOURS: i64 = 3;

// ─── Entry filters ────────────────────────────────────────────────────────────
pub const MIN_VOLUME_RATIO: f64 = 0.3;
pub const MAX_SPREAD_MULTIPLIER: f64 = 3.0;
pub const SPREAD_SAMPLE_WINDOW: usize = 100;

// ─── Plan A (hourly vote) ─────────────────────────────────────────────────────
pub const INTERVAL: &str = "60";
pub const STOP_LOSS_PCT: f64 = 2.0;
pub const TAKE_PROFIT_PCT: f64 = 4.0;
pub const TRAILING_STOP_ACTIVATE_PCT: f64 = 3.5;
pub const TRAILING_STOP_CALLBACK_PCT: f64 = 2.0;
pub const TIME_EXIT_HOURS: i64 = 48;
/// Seconds after the hourly close before the decision tick fires.
pub const BAR_SETTLE_SECS: u64 = 10;

// ─── Plan B (scalp) ───────────────────────────────────────────────────────────
pub const SCALP_ENTRY_INTERVAL: &str = "5";
pub const SCALP_FILTER_INTERVAL: &str = "15";
pub const SCALP_STOP_LOSS_PCT: f64 = 0.8;
pub const SCALP_TAKE_PROFIT_PCT: f64 = 1.4;
pub const SCALP_TRAILING_ACTIVATE_PCT: f64 = 0.8;
pub const SCALP_TRAILING_CALLBACK_PCT: f64 = 0.4;
pub const SCALP_TIME_EXIT_MINUTES: i64 = 45;
pub const SCALP_TIME_EXIT_BREAKEVEN_MIN: i64 = 30;
pub const SCALP_SIGNAL_INTERVAL_SEC: u64 = 60;
pub const SCALP_FEE_BUFFER_PCT: f64 = 0.15;
pub const SCALP_PULLBACK_DIST_PCT: f64 = 0.3;
pub const SCALP_PULLBACK_RSI_LOW: f64 = 35.0;
pub const SCALP_PULLBACK_RSI_HIGH: f64 = 65.0;
pub const SCALP_BB_VOL_RATIO: f64 = 1.5;
pub const SCALP_REGIME_ADX_MIN: f64 = 20.0;
pub const SCALP_REGIME_BB_WIDTH_MIN: f64 = 0.005;
/// Max live (ask - bid) / mid, in percent.
pub const SCALP_MAX_SPREAD_PCT: f64 = 0.05;

// ─── Loops ────────────────────────────────────────────────────────────────────
pub const MONITOR_INTERVAL_SECS: u64 = 10;
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// Hourly four-indicator vote.
    PlanA,
    /// Two-timeframe scalp.
    PlanB,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::PlanA => "plan_a",
            StrategyKind::PlanB => "plan_b",
        }
    }
}

/// Exit profile applied by the position lifecycle.
#[derive(Clone, Debug)]
pub struct ExitParams {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Widens the stop distance and narrows the target distance, in percent.
    pub fee_buffer_pct: f64,
    pub trailing_enabled: bool,
    pub trailing_activate_pct: f64,
    pub trailing_callback_pct: f64,
    /// Ratchet the stop to entry once held this long with PnL >= 0.
    pub breakeven_after: Option<Duration>,
    pub max_holding: Duration,
    pub fee_rate: f64,
}

impl ExitParams {
    pub fn plan_a() -> Self {
        ExitParams {
            stop_loss_pct: STOP_LOSS_PCT,
            take_profit_pct: TAKE_PROFIT_PCT,
            fee_buffer_pct: 0.0,
            trailing_enabled: true,
            trailing_activate_pct: TRAILING_STOP_ACTIVATE_PCT,
            trailing_callback_pct: TRAILING_STOP_CALLBACK_PCT,
            breakeven_after: None,
            max_holding: Duration::hours(TIME_EXIT_HOURS),
            fee_rate: TAKER_FEE_RATE,
        }
    }

    pub fn plan_b() -> Self {
        ExitParams {
            stop_loss_pct: SCALP_STOP_LOSS_PCT,
            take_profit_pct: SCALP_TAKE_PROFIT_PCT,
            fee_buffer_pct: SCALP_FEE_BUFFER_PCT,
            trailing_enabled: true,
            trailing_activate_pct: SCALP_TRAILING_ACTIVATE_PCT,
            trailing_callback_pct: SCALP_TRAILING_CALLBACK_PCT,
            breakeven_after: Some(Duration::minutes(SCALP_TIME_EXIT_BREAKEVEN_MIN)),
            max_holding: Duration::minutes(SCALP_TIME_EXIT_MINUTES),
            fee_rate: TAKER_FEE_RATE,
        }
    }

    /// Effective stop distance in percent, buffer included.
    pub fn effective_sl_pct(&self) -> f64 {
        self.stop_loss_pct + self.fee_buffer_pct
    }

    /// Effective target distance in percent, never below 0.1 %.
    pub fn effective_tp_pct(&self) -> f64 {
        (self.take_profit_pct - self.fee_buffer_pct).max(0.1)
    }
}

/// Hard limits and sizing inputs of the risk manager.
#[derive(Clone, Debug)]
pub struct RiskParams {
    pub leverage: u32,
    pub position_size_pct: f64,
    pub high_confidence_size_pct: f64,
    pub max_position_size_pct: f64,
    pub high_confidence_threshold: u8,
    pub max_daily_loss_pct: f64,
    pub enforce_daily_loss_limit: bool,
    pub max_daily_trades: u32,
    pub cooldown_after_sl_streak: u32,
    pub cooldown: Duration,
    pub recent_sl_lookback: Duration,
    pub min_volume_ratio: f64,
    pub max_spread_multiplier: f64,
    /// Trading day boundary, hours east of UTC.
    pub day_offset_hours: i32,
}

impl Default for RiskParams {
    fn default() -> Self {
        RiskParams {
            leverage: LEVERAGE,
            position_size_pct: POSITION_SIZE_PCT,
            high_confidence_size_pct: HIGH_CONFIDENCE_SIZE_PCT,
            max_position_size_pct: MAX_POSITION_SIZE_PCT,
            high_confidence_threshold: crate::strategy::MAX_CONFIDENCE,
            max_daily_loss_pct: MAX_DAILY_LOSS_PCT,
            enforce_daily_loss_limit: true,
            max_daily_trades: MAX_DAILY_TRADES,
            cooldown_after_sl_streak: COOLDOWN_AFTER_SL_STREAK,
            cooldown: Duration::hours(COOLDOWN_HOURS),
            recent_sl_lookback: Duration::hours(RECENT_SL_LOOKBACK_HOURS),
            min_volume_ratio: MIN_VOLUME_RATIO,
            max_spread_multiplier: MAX_SPREAD_MULTIPLIER,
            day_offset_hours: 0,
        }
    }
}

/// Plan B trigger thresholds and optional gates.
#[derive(Clone, Debug)]
pub struct ScalpParams {
    pub filter_ema_fast: usize,
    pub filter_ema_slow: usize,
    pub pullback_dist_pct: f64,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub breakout_vol_ratio: f64,
    pub regime_filter: bool,
    pub regime_adx_min: f64,
    pub regime_bb_width_min: f64,
    pub spread_filter: bool,
    pub max_spread_pct: f64,
}

impl Default for ScalpParams {
    fn default() -> Self {
        ScalpParams {
            filter_ema_fast: 50,
            filter_ema_slow: 200,
            pullback_dist_pct: SCALP_PULLBACK_DIST_PCT,
            rsi_low: SCALP_PULLBACK_RSI_LOW,
            rsi_high: SCALP_PULLBACK_RSI_HIGH,
            breakout_vol_ratio: SCALP_BB_VOL_RATIO,
            regime_filter: true,
            regime_adx_min: SCALP_REGIME_ADX_MIN,
            regime_bb_width_min: SCALP_REGIME_BB_WIDTH_MIN,
            spread_filter: true,
            max_spread_pct: SCALP_MAX_SPREAD_PCT,
        }
    }
}

/// Immutable runtime configuration, loaded once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub symbol: String,
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub strategy: StrategyKind,
    pub interval: String,
    pub scalp_entry_interval: String,
    pub scalp_filter_interval: String,
    pub kline_limit: usize,
    pub risk: RiskParams,
    pub exits: ExitParams,
    pub scalp: ScalpParams,
    pub close_on_shutdown: bool,
    pub monitor_interval_secs: u64,
    /// Plan B decision cadence.
    pub scalp_signal_interval_secs: u64,
    /// Delay after a slot boundary before the decision tick reads bars.
    pub bar_settle_secs: u64,
    pub log_dir: String,
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(default),
    }
}

fn env_flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        let strategy = if env_flag("SCALP_MODE", false)? {
            StrategyKind::PlanB
        } else {
            StrategyKind::PlanA
        };

        let risk = RiskParams {
            leverage: env_or("LEVERAGE", LEVERAGE)?,
            position_size_pct: env_or("POSITION_SIZE_PCT", POSITION_SIZE_PCT)?,
            high_confidence_size_pct: env_or("HIGH_CONFIDENCE_SIZE_PCT", HIGH_CONFIDENCE_SIZE_PCT)?,
            max_position_size_pct: env_or("MAX_POSITION_SIZE_PCT", MAX_POSITION_SIZE_PCT)?,
            high_confidence_threshold: env_or(
                "HIGH_CONFIDENCE_THRESHOLD",
                crate::strategy::MAX_CONFIDENCE,
            )?,
            max_daily_loss_pct: env_or("MAX_DAILY_LOSS_PCT", MAX_DAILY_LOSS_PCT)?,
            enforce_daily_loss_limit: env_flag("ENFORCE_DAILY_LOSS_LIMIT", true)?,
            max_daily_trades: env_or("MAX_DAILY_TRADES", MAX_DAILY_TRADES)?,
            cooldown_after_sl_streak: env_or("COOLDOWN_AFTER_SL_STREAK", COOLDOWN_AFTER_SL_STREAK)?,
            cooldown: Duration::hours(env_or("COOLDOWN_HOURS", COOLDOWN_HOURS)?),
            recent_sl_lookback: Duration::hours(RECENT_SL_LOOKBACK_HOURS),
            min_volume_ratio: env_or("MIN_VOLUME_RATIO", MIN_VOLUME_RATIO)?,
            max_spread_multiplier: MAX_SPREAD_MULTIPLIER,
            day_offset_hours: env_or("DAY_OFFSET_HOURS", 0)?,
        };

        let exits = match strategy {
            StrategyKind::PlanA => {
                let mut p = ExitParams::plan_a();
                p.stop_loss_pct = env_or("STOP_LOSS_PCT", p.stop_loss_pct)?;
                p.take_profit_pct = env_or("TAKE_PROFIT_PCT", p.take_profit_pct)?;
                p.trailing_enabled = env_flag("ENABLE_TRAILING_STOP", p.trailing_enabled)?;
                p.trailing_activate_pct =
                    env_or("TRAILING_STOP_ACTIVATE_PCT", p.trailing_activate_pct)?;
                p.trailing_callback_pct =
                    env_or("TRAILING_STOP_CALLBACK_PCT", p.trailing_callback_pct)?;
                p
            }
            StrategyKind::PlanB => {
                let mut p = ExitParams::plan_b();
                p.stop_loss_pct = env_or("SCALP_STOP_LOSS_PCT", p.stop_loss_pct)?;
                p.take_profit_pct = env_or("SCALP_TAKE_PROFIT_PCT", p.take_profit_pct)?;
                p.fee_buffer_pct = env_or("SCALP_FEE_BUFFER_PCT", p.fee_buffer_pct)?;
                p.trailing_activate_pct =
                    env_or("SCALP_TRAILING_ACTIVATE_PCT", p.trailing_activate_pct)?;
                p.trailing_callback_pct =
                    env_or("SCALP_TRAILING_CALLBACK_PCT", p.trailing_callback_pct)?;
                p.max_holding = Duration::minutes(env_or(
                    "SCALP_TIME_EXIT_MINUTES",
                    SCALP_TIME_EXIT_MINUTES,
                )?);
                let be: i64 = env_or("SCALP_TIME_EXIT_BREAKEVEN_MIN", SCALP_TIME_EXIT_BREAKEVEN_MIN)?;
                p.breakeven_after = (be > 0).then(|| Duration::minutes(be));
                p
            }
        };

        let scalp = ScalpParams {
            filter_ema_fast: env_or("SCALP_FILTER_EMA_FAST", 50)?,
            filter_ema_slow: env_or("SCALP_FILTER_EMA_SLOW", 200)?,
            pullback_dist_pct: env_or("SCALP_PULLBACK_DIST_PCT", SCALP_PULLBACK_DIST_PCT)?,
            rsi_low: env_or("SCALP_PULLBACK_RSI_LOW", SCALP_PULLBACK_RSI_LOW)?,
            rsi_high: env_or("SCALP_PULLBACK_RSI_HIGH", SCALP_PULLBACK_RSI_HIGH)?,
            breakout_vol_ratio: env_or("SCALP_BB_VOL_RATIO", SCALP_BB_VOL_RATIO)?,
            regime_filter: env_flag("SCALP_REGIME_FILTER", true)?,
            regime_adx_min: env_or("SCALP_REGIME_ADX_MIN", SCALP_REGIME_ADX_MIN)?,
            regime_bb_width_min: env_or("SCALP_REGIME_BB_WIDTH_MIN", SCALP_REGIME_BB_WIDTH_MIN)?,
            spread_filter: env_flag("SCALP_SPREAD_FILTER", true)?,
            max_spread_pct: env_or("SCALP_MAX_SPREAD_PCT", SCALP_MAX_SPREAD_PCT)?,
        };

        Ok(Config {
            symbol: env_or("SYMBOL", DEFAULT_SYMBOL.to_string())?,
            testnet: env_flag("BYBIT_TESTNET", true)?,
            api_key: env_opt("BYBIT_API_KEY").ok_or(ConfigError::Missing("BYBIT_API_KEY"))?,
            api_secret: env_opt("BYBIT_API_SECRET")
                .ok_or(ConfigError::Missing("BYBIT_API_SECRET"))?,
            telegram_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
            strategy,
            interval: env_or("INTERVAL", INTERVAL.to_string())?,
            scalp_entry_interval: env_or("SCALP_ENTRY_INTERVAL", SCALP_ENTRY_INTERVAL.to_string())?,
            scalp_filter_interval: env_or(
                "SCALP_FILTER_INTERVAL",
                SCALP_FILTER_INTERVAL.to_string(),
            )?,
            kline_limit: KLINE_LIMIT,
            risk,
            exits,
            scalp,
            close_on_shutdown: env_flag("CLOSE_ON_SHUTDOWN", false)?,
            monitor_interval_secs: env_or("MONITOR_INTERVAL_SECS", MONITOR_INTERVAL_SECS)?,
            scalp_signal_interval_secs: env_or("SCALP_SIGNAL_INTERVAL_SEC", SCALP_SIGNAL_INTERVAL_SEC)?,
            bar_settle_secs: env_or("BAR_SETTLE_SECS", BAR_SETTLE_SECS)?,
            log_dir: env_or("LOG_DIR", "./logs".to_string())?,
        })
    }

    /// Rejects combinations the risk manager cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.leverage == 0 || self.risk.leverage > MAX_LEVERAGE {
            return Err(ConfigError::Rejected(format!(
                "LEVERAGE {} outside 1..={}",
                self.risk.leverage, MAX_LEVERAGE
            )));
        }
        if self.risk.position_size_pct <= 0.0
            || self.risk.position_size_pct > self.risk.max_position_size_pct
        {
            return Err(ConfigError::Rejected(format!(
                "POSITION_SIZE_PCT {} must be in (0, {}]",
                self.risk.position_size_pct, self.risk.max_position_size_pct
            )));
        }
        if self.exits.stop_loss_pct <= 0.0 || self.exits.take_profit_pct <= 0.0 {
            return Err(ConfigError::Rejected("SL/TP percentages must be positive".into()));
        }
        if self.exits.trailing_enabled && self.exits.trailing_callback_pct <= 0.0 {
            return Err(ConfigError::Rejected("trailing callback must be positive".into()));
        }
        if !(-12..=14).contains(&self.risk.day_offset_hours) {
            return Err(ConfigError::Rejected(format!(
                "DAY_OFFSET_HOURS {} is not a valid UTC offset",
                self.risk.day_offset_hours
            )));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &'static str {
        if self.testnet {
            BYBIT_TESTNET_URL
        } else {
            BYBIT_MAINNET_URL
        }
    }

    /// Decision cadence for the active strategy.
    pub fn decision_interval_secs(&self) -> u64 {
        match self.strategy {
            StrategyKind::PlanA => 3600,
            StrategyKind::PlanB => self.scalp_signal_interval_secs,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> Config {
        Config {
            symbol: DEFAULT_SYMBOL.into(),
            testnet: true,
            api_key: "k".into(),
            api_secret: "s".into(),
            telegram_token: None,
            telegram_chat_id: None,
            strategy: StrategyKind::PlanA,
            interval: INTERVAL.into(),
            scalp_entry_interval: SCALP_ENTRY_INTERVAL.into(),
            scalp_filter_interval: SCALP_FILTER_INTERVAL.into(),
            kline_limit: KLINE_LIMIT,
            risk: RiskParams::default(),
            exits: ExitParams::plan_a(),
            scalp: ScalpParams::default(),
            close_on_shutdown: false,
            monitor_interval_secs: MONITOR_INTERVAL_SECS,
            scalp_signal_interval_secs: SCALP_SIGNAL_INTERVAL_SEC,
            bar_settle_secs: BAR_SETTLE_SECS,
            log_dir: "./logs".into(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn leverage_above_max_is_rejected() {
        let mut cfg = sample();
        cfg.risk.leverage = MAX_LEVERAGE + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Rejected(_))));
    }

    #[test]
    fn base_size_above_ceiling_is_rejected() {
        let mut cfg = sample();
        cfg.risk.position_size_pct = 12.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scalp_fee_buffer_shapes_thresholds() {
        let p = ExitParams::plan_b();
        assert!((p.effective_sl_pct() - 0.95).abs() < 1e-12);
        assert!((p.effective_tp_pct() - 1.25).abs() < 1e-12);

        let mut tight = ExitParams::plan_b();
        tight.take_profit_pct = 0.2;
        assert_eq!(tight.effective_tp_pct(), 0.1);
    }
}
