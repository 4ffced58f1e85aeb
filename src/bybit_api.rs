use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::{Config, CATEGORY, MAX_RETRIES};
use crate::exchange::{classify_error, with_retry, ExchangeError, MarketData, OrderExecution, RetryPolicy};
use crate::risk_manager::step_decimals;
use crate::types::{Balance, Candle, Direction, ExchangePosition, Fill, Instrument, Quote};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
/// Leverage already at the requested value.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// Pause before reading executions of a fresh market order.
const FILL_SETTLE: Duration = Duration::from_millis(400);

fn parse_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn field(v: &serde_json::Value, key: &str) -> f64 {
    parse_f64(&v[key]).unwrap_or(0.0)
}

/// Kline interval in milliseconds; "D"/"W"/"M" or minutes.
fn interval_ms(interval: &str) -> i64 {
    match interval {
        "D" => 86_400_000,
        "W" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        m => m.parse::<i64>().unwrap_or(1) * 60_000,
    }
}

fn format_decimals(value: f64, step: f64) -> String {
    format!("{:.*}", step_decimals(step), value)
}

/// Parses a newest-first kline list into closed bars, oldest first.
fn parse_klines(list: &[serde_json::Value], interval: &str, now_ms: i64) -> Vec<Candle> {
    let mut candles: Vec<Candle> = list
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            let ts: i64 = arr.first()?.as_str()?.parse().ok()?;
            Some(Candle {
                timestamp: ts,
                open: parse_f64(arr.get(1)?)?,
                high: parse_f64(arr.get(2)?)?,
                low: parse_f64(arr.get(3)?)?,
                close: parse_f64(arr.get(4)?)?,
                volume: parse_f64(arr.get(5)?)?,
            })
        })
        .collect();
    candles.reverse(); // Bybit returns newest-first
    // the newest bar is still forming until its interval has elapsed
    if let Some(last) = candles.last() {
        if last.timestamp + interval_ms(interval) > now_ms {
            candles.pop();
        }
    }
    candles
}

fn parse_position(entry: &serde_json::Value) -> Option<ExchangePosition> {
    let size = field(entry, "size");
    if size <= 0.0 {
        return None;
    }
    let direction = match entry["side"].as_str() {
        Some("Buy") => Direction::Long,
        Some("Sell") => Direction::Short,
        _ => return None,
    };
    let created_time = entry["createdTime"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(ExchangePosition {
        direction,
        size,
        avg_price: field(entry, "avgPrice"),
        stop_loss: field(entry, "stopLoss"),
        take_profit: field(entry, "takeProfit"),
        created_time,
    })
}

/// Volume-weighted price, total quantity and total fee of an order's executions.
fn aggregate_executions(list: &[serde_json::Value]) -> Option<(f64, f64, f64)> {
    let (mut qty, mut value, mut fee) = (0.0, 0.0, 0.0);
    for exec in list {
        let q = field(exec, "execQty");
        qty += q;
        value += q * field(exec, "execPrice");
        fee += field(exec, "execFee");
    }
    (qty > 0.0).then(|| (value / qty, qty, fee))
}

/// `orderId` and average fill price of the order list entry matching `link_id`.
fn find_linked_order(list: &[serde_json::Value], link_id: &str) -> Option<(String, f64)> {
    list.iter()
        .find(|o| o["orderLinkId"].as_str() == Some(link_id))
        .and_then(|o| {
            let id = o["orderId"].as_str()?.to_string();
            Some((id, field(o, "avgPrice")))
        })
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Bybit V5 REST client for linear perpetuals.
#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    retry: RetryPolicy,
    instruments: Arc<Mutex<HashMap<String, Instrument>>>,
}

impl BybitClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ExchangeError::Transient(format!("HTTP client build failed: {}", e)))?;
        Ok(BybitClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            retry: RetryPolicy::new(MAX_RETRIES),
            instruments: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ExchangeError> {
        Self::new(config.base_url(), &config.api_key, &config.api_secret)
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).map_err(|e| {
            ExchangeError::Permanent { code: -1, message: format!("HMAC init failed: {}", e) }
        })?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Auth headers over `ts + key + recv_window + payload` (query for GET, body for POST).
    fn signed_headers(&self, payload: &str) -> Result<reqwest::header::HeaderMap, ExchangeError> {
        let ts = Self::timestamp_ms().to_string();
        let signature = self.sign(&format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, payload))?;

        let bad_header = |e: reqwest::header::InvalidHeaderValue| ExchangeError::Permanent {
            code: -1,
            message: format!("invalid header value: {}", e),
        };
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", self.api_key.parse().map_err(bad_header)?);
        headers.insert("X-BAPI-TIMESTAMP", ts.parse().map_err(bad_header)?);
        headers.insert("X-BAPI-SIGN", signature.parse().map_err(bad_header)?);
        headers.insert("X-BAPI-RECV-WINDOW", RECV_WINDOW.parse().map_err(bad_header)?);
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    /// Checks retCode and hands back the `result` object.
    async fn read_response(resp: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("Parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json["result"].clone())
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn get_public(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_response(resp).await
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let headers = self.signed_headers(query)?;
        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_response(resp).await
    }

    async fn post_signed(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, ExchangeError> {
        let body = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let headers = self.signed_headers(&body)?;
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_response(resp).await
    }

    async fn fetch_klines_raw(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        // one extra: the forming bar is dropped
        let query = format!("category={}&symbol={}&interval={}&limit={}", CATEGORY, symbol, interval, limit + 1);
        let result = self.get_public("/v5/market/kline", &query).await?;
        let list = result["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("missing result.list".into()))?;
        let mut candles = parse_klines(list, interval, Self::timestamp_ms() as i64);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn ticker_raw(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result = self.get_public("/v5/market/tickers", &query).await?;
        let t = result["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::Transient(format!("tickers: no entry for {}", symbol)))?;
        Ok(Quote { last: field(t, "lastPrice"), bid: field(t, "bid1Price"), ask: field(t, "ask1Price") })
    }

    async fn instrument_raw(&self, symbol: &str) -> Result<Instrument, ExchangeError> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result = self.get_public("/v5/market/instruments-info", &query).await?;
        let item = result["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::Permanent {
                code: -1,
                message: format!("instruments-info: unknown symbol {}", symbol),
            })?;
        Ok(Instrument {
            qty_step: field(&item["lotSizeFilter"], "qtyStep"),
            min_qty: field(&item["lotSizeFilter"], "minOrderQty"),
            tick_size: field(&item["priceFilter"], "tickSize"),
        })
    }

    async fn balance_raw(&self) -> Result<Balance, ExchangeError> {
        let result = self.get_signed("/v5/account/wallet-balance", "accountType=UNIFIED").await?;
        let acct = result["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::Transient("wallet-balance: empty list".into()))?;
        Ok(Balance { equity: field(acct, "totalEquity"), available: field(acct, "totalAvailableBalance") })
    }

    async fn position_raw(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result = self.get_signed("/v5/position/list", &query).await?;
        Ok(result["list"].as_array().and_then(|list| list.iter().find_map(parse_position)))
    }

    async fn set_leverage_raw(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category":     CATEGORY,
            "symbol":       symbol,
            "buyLeverage":  leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post_signed("/v5/position/set-leverage", body).await {
            Ok(_) => {
                log::info!("Leverage set: {} {}x", symbol, leverage);
                Ok(())
            }
            Err(ExchangeError::Permanent { code: LEVERAGE_NOT_MODIFIED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn market_order_raw(
        &self,
        symbol: &str,
        side: &str,
        qty: &str,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<String, ExchangeError> {
        let body = serde_json::json!({
            "category":    CATEGORY,
            "symbol":      symbol,
            "side":        side,
            "orderType":   "Market",
            "qty":         qty,
            "reduceOnly":  reduce_only,
            "orderLinkId": link_id,
            "timeInForce": "IOC",
        });
        let result = self.post_signed("/v5/order/create", body).await?;
        let order_id = result["orderId"].as_str().unwrap_or("unknown").to_string();
        log::info!("Order placed: {} {} qty={} reduceOnly={} orderId={}", side, symbol, qty, reduce_only, order_id);
        Ok(order_id)
    }

    async fn executions_raw(&self, symbol: &str, order_id: &str) -> Result<Option<(f64, f64, f64)>, ExchangeError> {
        let query = format!("category={}&symbol={}&orderId={}", CATEGORY, symbol, order_id);
        let result = self.get_signed("/v5/execution/list", &query).await?;
        Ok(result["list"].as_array().and_then(|l| aggregate_executions(l)))
    }

    async fn linked_order_raw(&self, symbol: &str, link_id: &str) -> Result<Option<(String, f64)>, ExchangeError> {
        let query = format!("category={}&symbol={}&orderLinkId={}", CATEGORY, symbol, link_id);
        let result = self.get_signed("/v5/order/realtime", &query).await?;
        Ok(result["list"].as_array().and_then(|l| find_linked_order(l, link_id)))
    }

    async fn trading_stop_raw(&self, symbol: &str, stop_loss: &str, take_profit: Option<&str>) -> Result<(), ExchangeError> {
        let mut body = serde_json::json!({
            "category":    CATEGORY,
            "symbol":      symbol,
            "stopLoss":    stop_loss,
            "tpslMode":    "Full",
            "positionIdx": 0,
        });
        if let Some(tp) = take_profit {
            body["takeProfit"] = serde_json::Value::String(tp.to_string());
        }
        self.post_signed("/v5/position/trading-stop", body).await?;
        log::info!("Trading stop set: {} SL={} TP={}", symbol, stop_loss, take_profit.unwrap_or("-"));
        Ok(())
    }

    // ── Retried helpers ───────────────────────────────────────────────────────

    async fn cached_instrument(&self, symbol: &str) -> Result<Instrument, ExchangeError> {
        if let Some(found) = self.instruments.lock().ok().and_then(|m| m.get(symbol).copied()) {
            return Ok(found);
        }
        let s = self.clone();
        let sym = symbol.to_string();
        let instrument = with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            async move { s.instrument_raw(&sym).await }
        }, self.retry).await?;
        if let Ok(mut cache) = self.instruments.lock() {
            cache.insert(symbol.to_string(), instrument);
        }
        Ok(instrument)
    }

    /// Order id behind `link_id`, for an order an earlier attempt already placed.
    async fn resolve_linked_order(&self, symbol: &str, link_id: &str) -> Result<(String, f64), ExchangeError> {
        let s = self.clone();
        let (sym, link) = (symbol.to_string(), link_id.to_string());
        let found = with_retry(|| {
            let s = s.clone();
            let (sym, link) = (sym.clone(), link.clone());
            async move { s.linked_order_raw(&sym, &link).await }
        }, self.retry).await?;
        found.ok_or_else(|| ExchangeError::Transient(format!("order {} not visible yet", link_id)))
    }

    /// Market order with a fixed link id so a retried request cannot double-fill.
    /// Once the order is accepted a `Fill` is always returned; `price` is 0.0
    /// when neither executions nor the ticker could be read.
    async fn market_order(&self, symbol: &str, side: &str, qty: f64, reduce_only: bool) -> Result<Fill, ExchangeError> {
        let instrument = self.cached_instrument(symbol).await?;
        let qty_str = format_decimals(qty, instrument.qty_step);
        let link_id = format!("xt-{}", Self::timestamp_ms());

        let s = self.clone();
        let (sym, si, q, link) = (symbol.to_string(), side.to_string(), qty_str.clone(), link_id.clone());
        let placed = with_retry(|| {
            let s = s.clone();
            let (sym, si, q, link) = (sym.clone(), si.clone(), q.clone(), link.clone());
            async move { s.market_order_raw(&sym, &si, &q, reduce_only, &link).await }
        }, self.retry).await;
        let (order_id, avg_price) = match placed {
            Ok(id) => (id, 0.0),
            Err(ExchangeError::DuplicateOrder(msg)) => {
                log::warn!("Order {} already accepted ({}), resolving by link id", link_id, msg);
                self.resolve_linked_order(symbol, &link_id).await?
            }
            Err(e) => return Err(e),
        };

        tokio::time::sleep(FILL_SETTLE).await;
        match self.executions_raw(symbol, &order_id).await {
            Ok(Some((price, filled, fee))) => return Ok(Fill { order_id, price, quantity: filled, fee: Some(fee) }),
            Ok(None) => {}
            Err(e) => log::warn!("Execution lookup failed for {}: {}", order_id, e),
        }
        if avg_price > 0.0 {
            return Ok(Fill { order_id, price: avg_price, quantity: qty, fee: None });
        }
        let price = match self.ticker(symbol).await {
            Ok(quote) => quote.last,
            Err(e) => {
                log::warn!("Fill price unknown for {}: {}", order_id, e);
                0.0
            }
        };
        Ok(Fill { order_id, price, quantity: qty, fee: None })
    }
}

#[async_trait]
impl MarketData for BybitClient {
    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        let iv = interval.to_string();
        with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            let iv = iv.clone();
            async move { s.fetch_klines_raw(&sym, &iv, limit).await }
        }, self.retry).await
    }

    async fn ticker(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            async move { s.ticker_raw(&sym).await }
        }, self.retry).await
    }

    async fn instrument(&self, symbol: &str) -> Result<Instrument, ExchangeError> {
        self.cached_instrument(symbol).await
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        let s = self.clone();
        with_retry(|| {
            let s = s.clone();
            async move { s.balance_raw().await }
        }, self.retry).await
    }

    async fn exchange_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            async move { s.position_raw(&sym).await }
        }, RetryPolicy::new(MAX_RETRIES + 2)).await
    }
}

#[async_trait]
impl OrderExecution for BybitClient {
    async fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        leverage: u32,
    ) -> Result<Fill, ExchangeError> {
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            async move { s.set_leverage_raw(&sym, leverage).await }
        }, self.retry).await?;
        self.market_order(symbol, direction.side(), quantity, false).await
    }

    async fn close_position(&self, symbol: &str, direction: Direction, quantity: f64) -> Result<Fill, ExchangeError> {
        self.market_order(symbol, direction.opposite().side(), quantity, true).await
    }

    async fn set_protective_orders(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), ExchangeError> {
        let tick = self.cached_instrument(symbol).await?.tick_size;
        let sl = format_decimals(stop_loss, tick);
        let tp = take_profit.map(|p| format_decimals(p, tick));
        let s = self.clone();
        let sym = symbol.to_string();
        with_retry(|| {
            let s = s.clone();
            let sym = sym.clone();
            let sl = sl.clone();
            let tp = tp.clone();
            async move { s.trading_stop_raw(&sym, &sl, tp.as_deref()).await }
        }, self.retry).await
    }
}
