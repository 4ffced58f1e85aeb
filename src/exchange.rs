use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Balance, Candle, Direction, ExchangePosition, Fill, Instrument, Quote};

// ── Error types ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// retCode=10006 or HTTP 429. retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Network, timeout, HTTP 5xx, server overload (retCode=10016).
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: retCode={code} msg={message}")]
    Permanent { code: i64, message: String },
    /// retCode=110072: an order with this link id already exists, so an
    /// earlier attempt reached the exchange.
    #[error("duplicate order link id: {0}")]
    DuplicateOrder(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimit { .. } | ExchangeError::Transient(_))
    }
}

/// retCode for a reused `orderLinkId`.
pub const DUPLICATE_ORDER_LINK_ID: i64 = 110072;

/// Classify a Bybit retCode + HTTP status into an ExchangeError.
pub fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => ExchangeError::Transient(msg.to_string()),
        (DUPLICATE_ORDER_LINK_ID, _) => ExchangeError::DuplicateOrder(msg.to_string()),
        _ => ExchangeError::Permanent { code: ret_code, message: msg.to_string() },
    }
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Runs `operation` with exponential backoff on transient errors and the
/// exchange's retry-after on rate limits. Permanent errors and duplicate
/// orders return at once.
pub async fn with_retry<F, Fut, T>(operation: F, policy: RetryPolicy) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut retries = 0;
    let mut delay = policy.base_delay;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(ExchangeError::RateLimit { retry_after }) => {
                if retries >= policy.max_retries {
                    return Err(ExchangeError::RateLimit { retry_after });
                }
                log::warn!("Rate limited, sleeping {}s (attempt {}/{})", retry_after, retries + 1, policy.max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(ExchangeError::Transient(msg)) => {
                if retries >= policy.max_retries {
                    return Err(ExchangeError::Transient(msg));
                }
                log::warn!(
                    "Transient error: {}, retry in {:?} ({}/{})",
                    msg, delay, retries + 1, policy.max_retries
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                retries += 1;
            }
            Err(e @ (ExchangeError::Permanent { .. } | ExchangeError::DuplicateOrder(_))) => return Err(e),
        }
    }
}

// ── Collaborator contracts ────────────────────────────────────────────────────

/// Read side of the exchange.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Closed bars only, oldest first.
    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    async fn ticker(&self, symbol: &str) -> Result<Quote, ExchangeError>;

    async fn instrument(&self, symbol: &str) -> Result<Instrument, ExchangeError>;

    async fn balance(&self) -> Result<Balance, ExchangeError>;

    /// `None` when the exchange holds no position for the symbol.
    async fn exchange_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError>;
}

/// Order side of the exchange.
#[async_trait]
pub trait OrderExecution: Send + Sync {
    /// Market entry at the given leverage.
    async fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        leverage: u32,
    ) -> Result<Fill, ExchangeError>;

    /// Reduce-only market exit of a position held in `direction`.
    async fn close_position(&self, symbol: &str, direction: Direction, quantity: f64) -> Result<Fill, ExchangeError>;

    /// Server-side stop (and target when given) on the open position.
    async fn set_protective_orders(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), ExchangeError>;
}
