pub mod binance;

pub use binance::{BinanceFuturesClient, ServerTimeClient};

use crate::error::ExchangeError;
use crate::models::{
    AssetBalance, Candle, MarketOrderRequest, OrderInfo, Position, StopMarketRequest, SymbolInfo,
    TickerVolume,
};
use async_trait::async_trait;

/// The slice of a USDT-margined perpetual futures venue the bot relies on
///
/// Implementations do a single attempt per call; retries and clock
/// resyncs are layered on top by the request executor.
#[async_trait]
pub trait FuturesApi: Send + Sync {
    /// Symbol metadata and trading rules for every listed contract
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, ExchangeError>;

    /// 24h quote volumes for all symbols
    async fn ticker_volumes(&self) -> Result<Vec<TickerVolume>, ExchangeError>;

    /// Latest traded price for a symbol
    async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn balances(&self) -> Result<Vec<AssetBalance>, ExchangeError>;

    /// Position records for every symbol, including flat ones
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// True when hedge (dual-side) mode is active
    async fn dual_side_position(&self) -> Result<bool, ExchangeError>;

    async fn set_dual_side_position(&self, dual: bool) -> Result<(), ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Most recent `limit` candles, oldest first; the last may still be forming
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderInfo, ExchangeError>;

    /// Stop-market order with close-position semantics
    async fn place_stop_market_order(
        &self,
        request: &StopMarketRequest,
    ) -> Result<OrderInfo, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError>;

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderInfo, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderInfo>, ExchangeError>;
}
