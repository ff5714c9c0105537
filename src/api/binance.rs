use super::FuturesApi;
use crate::clock::{ClockSync, TimeSource};
use crate::error::ExchangeError;
use crate::models::{
    AssetBalance, Candle, MarketOrderRequest, OrderInfo, OrderSide, OrderStatus, OrderType,
    Position, StopMarketRequest, SymbolInfo, SymbolRules, TickerVolume,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

// USDT-M futures REST API
// Docs: https://developers.binance.com/docs/derivatives/usds-margined-futures
pub const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Connection settings for [`BinanceFuturesClient`]
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub requests_per_minute: u32,
    pub request_timeout: Duration,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeRaw {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoRaw {
    symbols: Vec<SymbolRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolRaw {
    symbol: String,
    status: String,
    quote_asset: String,
    #[serde(default)]
    contract_type: String,
    price_precision: u32,
    quantity_precision: u32,
    #[serde(default)]
    filters: Vec<FilterRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterRaw {
    filter_type: String,
    step_size: Option<String>,
    min_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hRaw {
    symbol: String,
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct TickerPriceRaw {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BalanceRaw {
    asset: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRaw {
    symbol: String,
    position_amt: Option<String>,
    entry_price: Option<String>,
    mark_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionModeRaw {
    dual_side_position: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRaw {
    symbol: String,
    order_id: i64,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    close_position: bool,
    stop_price: Option<String>,
}

// ============== Conversions ==============

fn parse_decimal(value: &str, field: &str) -> Result<Decimal, ExchangeError> {
    value
        .parse::<Decimal>()
        .map_err(|e| ExchangeError::Malformed(format!("{} '{}': {}", field, value, e)))
}

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|e| ExchangeError::Malformed(format!("{} '{}': {}", field, value, e)))
}

impl SymbolRaw {
    /// `None` when the LOT_SIZE filter is missing or unparsable
    fn into_symbol_info(self) -> Option<SymbolInfo> {
        let lot_size = self.filters.iter().find(|f| f.filter_type == "LOT_SIZE")?;
        let step_size = lot_size.step_size.as_deref()?.parse::<Decimal>().ok()?;
        let min_qty = lot_size.min_qty.as_deref()?.parse::<Decimal>().ok()?;

        Some(SymbolInfo {
            symbol: self.symbol,
            status: self.status,
            quote_asset: self.quote_asset,
            contract_type: self.contract_type,
            rules: SymbolRules {
                step_size,
                min_qty,
                quantity_precision: self.quantity_precision,
                price_precision: self.price_precision,
            },
        })
    }
}

impl PositionRaw {
    /// `None` unless amount, entry and mark price are all present and numeric
    fn into_position(self) -> Option<Position> {
        let amount = self.position_amt.as_deref()?.parse::<Decimal>().ok()?;
        let entry_price = self.entry_price.as_deref()?.parse::<f64>().ok()?;
        let mark_price = self.mark_price.as_deref()?.parse::<f64>().ok()?;

        Some(Position {
            symbol: self.symbol,
            amount,
            entry_price,
            mark_price,
        })
    }
}

impl TryFrom<OrderRaw> for OrderInfo {
    type Error = ExchangeError;

    fn try_from(raw: OrderRaw) -> Result<Self, Self::Error> {
        let side = match raw.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => {
                return Err(ExchangeError::Malformed(format!(
                    "order {} has unknown side '{}'",
                    raw.order_id, other
                )))
            }
        };

        let stop_price = match raw.stop_price.as_deref() {
            Some(p) => Some(parse_decimal(p, "stopPrice")?).filter(|p| !p.is_zero()),
            None => None,
        };

        Ok(OrderInfo {
            symbol: raw.symbol,
            order_id: raw.order_id,
            side,
            order_type: OrderType::from_exchange(&raw.order_type),
            status: OrderStatus::from_exchange(&raw.status),
            reduce_only: raw.reduce_only,
            close_position: raw.close_position,
            stop_price,
        })
    }
}

/// Kline rows are positional arrays: [openTime, open, high, low, close, volume, closeTime, ...]
fn parse_kline(row: &[Value]) -> Result<Candle, ExchangeError> {
    fn number(row: &[Value], idx: usize, field: &str) -> Result<f64, ExchangeError> {
        match row.get(idx) {
            Some(Value::String(s)) => parse_f64(s, field),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ExchangeError::Malformed(format!("kline {} not a number", field))),
            _ => Err(ExchangeError::Malformed(format!("kline missing {}", field))),
        }
    }

    let open_time_ms = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| ExchangeError::Malformed("kline missing open time".into()))?;
    let open_time = Utc
        .timestamp_millis_opt(open_time_ms)
        .single()
        .ok_or_else(|| ExchangeError::Malformed(format!("kline open time {}", open_time_ms)))?;

    Ok(Candle {
        open_time,
        open: number(row, 1, "open")?,
        high: number(row, 2, "high")?,
        low: number(row, 3, "low")?,
        close: number(row, 4, "close")?,
        volume: number(row, 5, "volume")?,
        ma20: None,
        ma60: None,
    })
}

/// Turn a response into `T`, mapping exchange error bodies to [`ExchangeError::Api`]
async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return Ok(serde_json::from_str(&body)?);
    }

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => Err(ExchangeError::Api {
            code: err.code,
            msg: err.msg,
        }),
        Err(_) => Err(ExchangeError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

// ============== Server time ==============

/// Unsigned reader of the exchange clock, used by [`ClockSync`]
#[derive(Clone)]
pub struct ServerTimeClient {
    client: Client,
    base_url: String,
}

impl ServerTimeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExchangeError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TimeSource for ServerTimeClient {
    async fn server_time_millis(&self) -> Result<i64, ExchangeError> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let response = self.client.get(&url).send().await?;
        let time: ServerTimeRaw = decode_response(response).await?;
        Ok(time.server_time)
    }
}

// ============== Client ==============

/// Signed client for the Binance USDT-M futures REST API
///
/// Every signed request is stamped with the exchange-aligned time from
/// [`ClockSync`]. A client-side quota keeps us under the request weight limit.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    clock_sync: Arc<ClockSync>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

impl BinanceFuturesClient {
    pub fn new(settings: BinanceSettings, clock_sync: Arc<ClockSync>) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;

        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            api_secret: settings.api_secret,
            recv_window_ms: settings.recv_window_ms,
            clock_sync,
            rate_limiter,
        })
    }

    /// HMAC-SHA256 of the query string, hex encoded
    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Malformed(format!("invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let query = encode_params(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self.client.get(&url).send().await?;
        decode_response(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let timestamp = self.clock_sync.synced_timestamp().await;
        let mut query = encode_params(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.recv_window_ms, timestamp
        ));

        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        tracing::debug!(%method, path, "Signed request");

        let response = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        decode_response(response).await
    }
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl FuturesApi for BinanceFuturesClient {
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, ExchangeError> {
        let info: ExchangeInfoRaw = self.public("/fapi/v1/exchangeInfo", &[]).await?;

        let total = info.symbols.len();
        let symbols: Vec<SymbolInfo> = info
            .symbols
            .into_iter()
            .filter_map(SymbolRaw::into_symbol_info)
            .collect();

        if symbols.len() < total {
            tracing::debug!(
                "Skipped {} symbols without usable LOT_SIZE rules",
                total - symbols.len()
            );
        }

        Ok(symbols)
    }

    async fn ticker_volumes(&self) -> Result<Vec<TickerVolume>, ExchangeError> {
        let tickers: Vec<Ticker24hRaw> = self.public("/fapi/v1/ticker/24hr", &[]).await?;

        tickers
            .into_iter()
            .map(|t| {
                Ok(TickerVolume {
                    quote_volume: parse_f64(&t.quote_volume, "quoteVolume")?,
                    symbol: t.symbol,
                })
            })
            .collect()
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPriceRaw = self
            .public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_f64(&ticker.price, "price")
    }

    async fn balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let balances: Vec<BalanceRaw> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;

        balances
            .into_iter()
            .map(|b| {
                Ok(AssetBalance {
                    balance: parse_f64(&b.balance, "balance")?,
                    asset: b.asset,
                })
            })
            .collect()
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let raw: Vec<PositionRaw> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;

        let mut positions = Vec::with_capacity(raw.len());
        for record in raw {
            let symbol = record.symbol.clone();
            match record.into_position() {
                Some(position) => positions.push(position),
                None => tracing::warn!(symbol = %symbol, "Dropping incomplete position record"),
            }
        }

        Ok(positions)
    }

    async fn dual_side_position(&self) -> Result<bool, ExchangeError> {
        let mode: PositionModeRaw = self
            .signed(Method::GET, "/fapi/v1/positionSide/dual", &[])
            .await?;
        Ok(mode.dual_side_position)
    }

    async fn set_dual_side_position(&self, dual: bool) -> Result<(), ExchangeError> {
        let _: Value = self
            .signed(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                &[("dualSidePosition", dual.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<Vec<Value>> = self
            .public(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", request.quantity.normalize().to_string()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let raw: OrderRaw = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        OrderInfo::try_from(raw)
    }

    async fn place_stop_market_order(
        &self,
        request: &StopMarketRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        let params = [
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("stopPrice", request.stop_price.normalize().to_string()),
            ("closePosition", "true".to_string()),
        ];

        let raw: OrderRaw = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        OrderInfo::try_from(raw)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        let _: Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderInfo, ExchangeError> {
        let raw: OrderRaw = self
            .signed(
                Method::GET,
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        OrderInfo::try_from(raw)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderInfo>, ExchangeError> {
        let raw: Vec<OrderRaw> = self
            .signed(
                Method::GET,
                "/fapi/v1/openOrders",
                &[("symbol", symbol.to_string())],
            )
            .await?;

        raw.into_iter().map(OrderInfo::try_from).collect()
    }
}
