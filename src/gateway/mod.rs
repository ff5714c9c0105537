// Market and account reads, order writes; the only path to the exchange
use crate::api::FuturesApi;
use crate::clock::Clock;
use crate::error::{ErrorKind, ExchangeError};
use crate::execution::request::RequestExecutor;
use crate::models::{
    Candle, MarketOrderRequest, OrderInfo, Position, StopMarketRequest, SymbolInfo, SymbolRules,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const HOURLY: &str = "1h";

const QUOTE_ASSET: &str = "USDT";
const PERPETUAL: &str = "PERPETUAL";

/// Cached exchange metadata keyed by symbol
#[derive(Debug, Default)]
struct RulesCache {
    symbols: HashMap<String, SymbolInfo>,
    fetched_at_millis: Option<i64>,
}

impl RulesCache {
    fn is_fresh(&self, now_millis: i64, ttl: Duration) -> bool {
        match self.fetched_at_millis {
            Some(at) => now_millis - at < ttl.as_millis() as i64,
            None => false,
        }
    }
}

/// Every exchange call goes through here, and through the request executor
///
/// Failed calls are logged with their error class before being returned,
/// so callers only decide whether to skip the symbol or the cycle.
pub struct MarketGateway {
    api: Arc<dyn FuturesApi>,
    executor: RequestExecutor,
    clock: Arc<dyn Clock>,
    rules_ttl: Duration,
    rules: RwLock<RulesCache>,
}

impl MarketGateway {
    pub fn new(
        api: Arc<dyn FuturesApi>,
        executor: RequestExecutor,
        clock: Arc<dyn Clock>,
        rules_ttl: Duration,
    ) -> Self {
        Self {
            api,
            executor,
            clock,
            rules_ttl,
            rules: RwLock::new(RulesCache::default()),
        }
    }

    async fn call<T, F, Fut>(&self, what: &str, call: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let result = self.executor.execute(what, call).await;
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::NoOp => tracing::debug!("{}: {}", what, e),
                kind => tracing::warn!(?kind, "{} failed: {}", what, e),
            }
        }
        result
    }

    // ============== Account ==============

    /// USDT wallet balance; zero when the account holds no USDT entry
    pub async fn usdt_balance(&self) -> Result<f64, ExchangeError> {
        let balances = self.call("balance", move || self.api.balances()).await?;

        Ok(balances
            .iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .map(|b| b.balance)
            .unwrap_or(0.0))
    }

    /// All positions with a non-zero amount
    pub async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let positions = self.call("positions", move || self.api.positions()).await?;
        Ok(positions.into_iter().filter(|p| !p.is_flat()).collect())
    }

    /// The open position for `symbol`, `None` when flat or unreported
    pub async fn position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let positions = self.call("positions", move || self.api.positions()).await?;
        Ok(positions
            .into_iter()
            .find(|p| p.symbol == symbol && !p.is_flat()))
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderInfo>, ExchangeError> {
        self.call("open orders", move || self.api.open_orders(symbol))
            .await
    }

    pub async fn is_dual_side_position(&self) -> Result<bool, ExchangeError> {
        self.call("position mode", move || self.api.dual_side_position())
            .await
    }

    pub async fn set_one_way_mode(&self) -> Result<(), ExchangeError> {
        self.call("set position mode", move || {
            self.api.set_dual_side_position(false)
        })
        .await
    }

    // ============== Market data ==============

    /// Most recent `limit` candles, oldest first
    ///
    /// An empty series is reported as malformed so callers skip the symbol.
    pub async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self
            .call("klines", move || self.api.klines(symbol, interval, limit))
            .await?;

        if candles.is_empty() {
            tracing::warn!(symbol = %symbol, "No klines returned");
            return Err(ExchangeError::Malformed(format!("no klines for {}", symbol)));
        }

        Ok(candles)
    }

    /// Most recent `limit` fully-closed hourly candles, oldest first
    ///
    /// Fetches one extra kline and drops any hour that has not ended yet.
    pub async fn closed_hourly_candles(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut candles = self.candles(symbol, HOURLY, limit.saturating_add(1)).await?;

        let now = self.clock.now();
        candles.retain(|c| c.open_time + chrono::Duration::hours(1) <= now);
        let excess = candles.len().saturating_sub(limit as usize);
        candles.drain(..excess);

        if candles.is_empty() {
            return Err(ExchangeError::Malformed(format!("no closed klines for {}", symbol)));
        }

        Ok(candles)
    }

    /// The current, possibly still forming, hourly candle
    pub async fn latest_hourly_candle(&self, symbol: &str) -> Result<Candle, ExchangeError> {
        let mut candles = self.candles(symbol, HOURLY, 1).await?;
        candles
            .pop()
            .ok_or_else(|| ExchangeError::Malformed(format!("no klines for {}", symbol)))
    }

    pub async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.call("ticker price", move || self.api.latest_price(symbol))
            .await
    }

    // ============== Trading rules ==============

    /// Fetch exchange metadata and replace the rules cache
    pub async fn exchange_symbols(&self) -> Result<Vec<SymbolInfo>, ExchangeError> {
        let symbols = self
            .call("exchange info", move || self.api.exchange_info())
            .await?;

        let mut cache = self.rules.write().await;
        cache.symbols = symbols
            .iter()
            .map(|s| (s.symbol.clone(), s.clone()))
            .collect();
        cache.fetched_at_millis = Some(self.clock.now_millis());
        tracing::debug!("Cached trading rules for {} symbols", cache.symbols.len());

        Ok(symbols)
    }

    /// Symbol metadata from the cache
    ///
    /// Refetches when the cache is older than the TTL or does not know the
    /// symbol. `None` if the exchange does not list it either.
    pub async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, ExchangeError> {
        {
            let cache = self.rules.read().await;
            if cache.is_fresh(self.clock.now_millis(), self.rules_ttl) {
                if let Some(info) = cache.symbols.get(symbol) {
                    return Ok(Some(info.clone()));
                }
            }
        }

        let symbols = self.exchange_symbols().await?;
        let info = symbols.into_iter().find(|s| s.symbol == symbol);
        if info.is_none() {
            tracing::warn!(symbol = %symbol, "Symbol not listed in exchange info");
        }
        Ok(info)
    }

    pub async fn symbol_rules(&self, symbol: &str) -> Result<Option<SymbolRules>, ExchangeError> {
        Ok(self.symbol_info(symbol).await?.map(|info| info.rules))
    }

    /// Top `limit` tradable USDT perpetuals by 24h quote volume, highest first
    pub async fn top_volume_symbols(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<String>, ExchangeError> {
        let eligible: HashSet<String> = self
            .exchange_symbols()
            .await?
            .into_iter()
            .filter(|s| {
                s.quote_asset == QUOTE_ASSET
                    && s.contract_type == PERPETUAL
                    && s.is_trading()
                    && !exclude.contains(&s.symbol)
            })
            .map(|s| s.symbol)
            .collect();

        let mut tickers: Vec<_> = self
            .call("24h tickers", move || self.api.ticker_volumes())
            .await?
            .into_iter()
            .filter(|t| eligible.contains(&t.symbol))
            .collect();

        tickers.sort_by(|a, b| b.quote_volume.total_cmp(&a.quote_volume));

        Ok(tickers
            .into_iter()
            .take(limit)
            .map(|t| t.symbol)
            .collect())
    }

    // ============== Orders ==============

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.call("set leverage", move || self.api.set_leverage(symbol, leverage))
            .await
    }

    pub async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        self.call("market order", move || self.api.place_market_order(request))
            .await
    }

    pub async fn place_stop_market_order(
        &self,
        request: &StopMarketRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        self.call("stop-market order", move || {
            self.api.place_stop_market_order(request)
        })
        .await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.call("cancel order", move || self.api.cancel_order(symbol, order_id))
            .await
    }

    pub async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderInfo, ExchangeError> {
        self.call("query order", move || self.api.get_order(symbol, order_id))
            .await
    }
}
