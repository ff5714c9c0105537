#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use perpbot::api::FuturesApi;
use perpbot::clock::{ClockSync, ManualClock, TimeSource};
use perpbot::execution::RequestExecutor;
use perpbot::gateway::MarketGateway;
use perpbot::models::{
    AssetBalance, Candle, MarketOrderRequest, OrderInfo, OrderSide, OrderStatus, OrderType,
    Position, StopMarketRequest, SymbolInfo, SymbolRules, TickerVolume,
};
use perpbot::ExchangeError;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_MILLIS: i64 = 1_748_771_940_000; // 2025-06-01 09:59:00 UTC

#[derive(Default)]
struct State {
    symbols: Vec<SymbolInfo>,
    volumes: Vec<TickerVolume>,
    prices: HashMap<String, f64>,
    klines: HashMap<String, Vec<Candle>>,
    positions: HashMap<String, Position>,
    orders: Vec<OrderInfo>,
    market_orders: Vec<MarketOrderRequest>,
    leverage: HashMap<String, u32>,
    balances: Vec<AssetBalance>,
    dual_side: bool,
    next_order_id: i64,
    server_time: i64,
    stop_status_override: Option<OrderStatus>,
    failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    calls: HashMap<&'static str, usize>,
}

/// In-memory USDT-M venue: market orders fill at once, stops rest until triggered
pub struct FakeExchange {
    state: Mutex<State>,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_order_id: 1000,
                server_time: START_MILLIS,
                balances: vec![AssetBalance {
                    asset: "USDT".to_string(),
                    balance: 1000.0,
                }],
                ..State::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record the call and pop a scripted failure for it, if any
    fn enter(&self, method: &'static str) -> Result<(), ExchangeError> {
        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        match state.failures.get_mut(method).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ============== Setup ==============

    pub fn list_symbol(&self, symbol: &str, rules: SymbolRules, quote_volume: f64) {
        self.list_symbol_with(symbol, "TRADING", "PERPETUAL", rules, quote_volume);
    }

    pub fn list_symbol_with(
        &self,
        symbol: &str,
        status: &str,
        contract_type: &str,
        rules: SymbolRules,
        quote_volume: f64,
    ) {
        let mut state = self.lock();
        state.symbols.push(SymbolInfo {
            symbol: symbol.to_string(),
            status: status.to_string(),
            quote_asset: "USDT".to_string(),
            contract_type: contract_type.to_string(),
            rules,
        });
        state.volumes.push(TickerVolume {
            symbol: symbol.to_string(),
            quote_volume,
        });
    }

    pub fn delist_all(&self) {
        let mut state = self.lock();
        state.symbols.clear();
        state.volumes.clear();
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_klines(&self, symbol: &str, candles: Vec<Candle>) {
        self.lock().klines.insert(symbol.to_string(), candles);
    }

    pub fn set_position(&self, symbol: &str, amount: Decimal, entry_price: f64) {
        self.lock().positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                amount,
                entry_price,
                mark_price: entry_price,
            },
        );
    }

    pub fn set_dual_side(&self, dual: bool) {
        self.lock().dual_side = dual;
    }

    pub fn set_server_time(&self, millis: i64) {
        self.lock().server_time = millis;
    }

    /// Status reported for stop orders placed from now on
    pub fn set_stop_status(&self, status: Option<OrderStatus>) {
        self.lock().stop_status_override = status;
    }

    /// Fail the next call of `method` with `err`; stack calls to fail repeatedly
    pub fn fail_next(&self, method: &'static str, err: ExchangeError) {
        self.lock().failures.entry(method).or_default().push_back(err);
    }

    /// A resting stop placed outside the bot
    pub fn add_resting_stop(&self, symbol: &str, side: OrderSide, stop_price: Decimal) -> i64 {
        let mut state = self.lock();
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state.orders.push(OrderInfo {
            symbol: symbol.to_string(),
            order_id,
            side,
            order_type: OrderType::StopMarket,
            status: OrderStatus::New,
            reduce_only: true,
            close_position: true,
            stop_price: Some(stop_price),
        });
        order_id
    }

    /// Fire the live stop on `symbol`: the order fills and the position goes flat
    pub fn trigger_stop(&self, symbol: &str) {
        let mut state = self.lock();
        for order in state.orders.iter_mut() {
            if order.symbol == symbol
                && order.order_type == OrderType::StopMarket
                && order.status == OrderStatus::New
            {
                order.status = OrderStatus::Filled;
            }
        }
        if let Some(position) = state.positions.get_mut(symbol) {
            position.amount = Decimal::ZERO;
        }
    }

    // ============== Inspection ==============

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn live_protective_orders(&self, symbol: &str) -> Vec<OrderInfo> {
        self.lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::New && o.is_protective())
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: i64) -> Option<OrderInfo> {
        self.lock()
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
    }

    pub fn position_amount(&self, symbol: &str) -> Decimal {
        self.lock()
            .positions
            .get(symbol)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn market_orders(&self) -> Vec<MarketOrderRequest> {
        self.lock().market_orders.clone()
    }

    pub fn leverage(&self, symbol: &str) -> Option<u32> {
        self.lock().leverage.get(symbol).copied()
    }

    pub fn dual_side(&self) -> bool {
        self.lock().dual_side
    }
}

fn unknown_order() -> ExchangeError {
    ExchangeError::Api {
        code: -2011,
        msg: "Unknown order sent.".to_string(),
    }
}

#[async_trait]
impl TimeSource for FakeExchange {
    async fn server_time_millis(&self) -> Result<i64, ExchangeError> {
        self.enter("server_time")?;
        Ok(self.lock().server_time)
    }
}

#[async_trait]
impl FuturesApi for FakeExchange {
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, ExchangeError> {
        self.enter("exchange_info")?;
        Ok(self.lock().symbols.clone())
    }

    async fn ticker_volumes(&self) -> Result<Vec<TickerVolume>, ExchangeError> {
        self.enter("ticker_volumes")?;
        Ok(self.lock().volumes.clone())
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.enter("latest_price")?;
        self.lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Api {
                code: -1121,
                msg: "Invalid symbol.".to_string(),
            })
    }

    async fn balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        self.enter("balances")?;
        Ok(self.lock().balances.clone())
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.enter("positions")?;
        let mut positions: Vec<Position> = self.lock().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn dual_side_position(&self) -> Result<bool, ExchangeError> {
        self.enter("dual_side_position")?;
        Ok(self.lock().dual_side)
    }

    async fn set_dual_side_position(&self, dual: bool) -> Result<(), ExchangeError> {
        self.enter("set_dual_side_position")?;
        let mut state = self.lock();
        if state.dual_side == dual {
            return Err(ExchangeError::Api {
                code: -4059,
                msg: "No need to change position side.".to_string(),
            });
        }
        state.dual_side = dual;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.enter("set_leverage")?;
        self.lock().leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.enter("klines")?;
        let state = self.lock();
        let series = state.klines.get(symbol).cloned().unwrap_or_default();
        let skip = series.len().saturating_sub(limit as usize);
        Ok(series.into_iter().skip(skip).collect())
    }

    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        self.enter("place_market_order")?;
        let mut state = self.lock();

        let price = state.prices.get(&request.symbol).copied().unwrap_or(0.0);
        let signed = match request.side {
            OrderSide::Buy => request.quantity,
            OrderSide::Sell => -request.quantity,
        };

        let position = state
            .positions
            .entry(request.symbol.clone())
            .or_insert_with(|| Position {
                symbol: request.symbol.clone(),
                amount: Decimal::ZERO,
                entry_price: 0.0,
                mark_price: price,
            });
        if position.amount.is_zero() {
            position.entry_price = price;
        }
        position.amount += signed;
        position.mark_price = price;

        let order_id = state.next_order_id;
        state.next_order_id += 1;
        let order = OrderInfo {
            symbol: request.symbol.clone(),
            order_id,
            side: request.side,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            reduce_only: request.reduce_only,
            close_position: false,
            stop_price: None,
        };
        state.orders.push(order.clone());
        state.market_orders.push(request.clone());
        Ok(order)
    }

    async fn place_stop_market_order(
        &self,
        request: &StopMarketRequest,
    ) -> Result<OrderInfo, ExchangeError> {
        self.enter("place_stop_market_order")?;
        let mut state = self.lock();

        let order_id = state.next_order_id;
        state.next_order_id += 1;
        let order = OrderInfo {
            symbol: request.symbol.clone(),
            order_id,
            side: request.side,
            order_type: OrderType::StopMarket,
            status: state.stop_status_override.unwrap_or(OrderStatus::New),
            reduce_only: true,
            close_position: true,
            stop_price: Some(request.stop_price),
        };
        state.orders.push(order.clone());

        // The acknowledgement always reads NEW; only a later query shows otherwise
        Ok(OrderInfo {
            status: OrderStatus::New,
            ..order
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.enter("cancel_order")?;
        let mut state = self.lock();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.symbol == symbol && o.status == OrderStatus::New)
            .ok_or_else(unknown_order)?;
        order.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderInfo, ExchangeError> {
        self.enter("get_order")?;
        self.lock()
            .orders
            .iter()
            .find(|o| o.order_id == order_id && o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Api {
                code: -2013,
                msg: "Order does not exist.".to_string(),
            })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderInfo>, ExchangeError> {
        self.enter("open_orders")?;
        Ok(self
            .lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::New)
            .cloned()
            .collect())
    }
}

// ============== Fixtures ==============

pub fn rules(
    step_size: Decimal,
    min_qty: Decimal,
    quantity_precision: u32,
    price_precision: u32,
) -> SymbolRules {
    SymbolRules {
        step_size,
        min_qty,
        quantity_precision,
        price_precision,
    }
}

/// The 09:00 candle, still forming at `START_MILLIS`
pub fn hourly(open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        open_time: Utc.timestamp_millis_opt(START_MILLIS - 59 * 60_000).unwrap(),
        open,
        high,
        low,
        close,
        volume: 1_000.0,
        ma20: None,
        ma60: None,
    }
}

/// Closed hourly candles oldest first, ending with the 08:00 hour; each is
/// flat at its close except the last, which gets its own open/high/low
pub fn series(closes: &[f64], last: (f64, f64, f64)) -> Vec<Candle> {
    let end = Utc.timestamp_millis_opt(START_MILLIS - 119 * 60_000).unwrap();
    let n = closes.len() as i64;
    let mut candles: Vec<Candle> = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            open_time: end - ChronoDuration::hours(n - 1 - i as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000.0,
            ma20: None,
            ma60: None,
        })
        .collect();
    if let Some(c) = candles.last_mut() {
        c.open = last.0;
        c.high = last.1;
        c.low = last.2;
    }
    candles
}

/// Last closed candle is a long signal: close 104 > MA60 103.4 > MA20 100.2 > open 100.1.
/// A quiet forming hour follows.
pub fn long_signal_series() -> Vec<Candle> {
    let mut closes = vec![110.0; 60];
    closes.extend(vec![100.0; 39]);
    closes.push(104.0);
    let mut candles = series(&closes, (100.1, 104.2, 100.0));
    candles.push(hourly(104.0, 104.3, 103.9, 104.1));
    candles
}

/// Last closed candle is a short signal: close 96 < MA60 96.6 < MA20 99.8 < open 99.9.
/// A quiet forming hour follows.
pub fn short_signal_series() -> Vec<Candle> {
    let mut closes = vec![90.0; 60];
    closes.extend(vec![100.0; 39]);
    closes.push(96.0);
    let mut candles = series(&closes, (99.9, 100.0, 95.8));
    candles.push(hourly(96.0, 96.1, 95.8, 95.9));
    candles
}

/// Closed history is quiet; only the still-forming hour looks like a long signal
pub fn forming_long_signal_series() -> Vec<Candle> {
    let mut closes = vec![110.0; 60];
    closes.extend(vec![100.0; 39]);
    let mut candles = series(&closes, (100.0, 100.0, 100.0));
    candles.push(hourly(100.1, 104.2, 100.0, 104.0));
    candles
}

pub struct Harness {
    pub exchange: Arc<FakeExchange>,
    pub clock: ManualClock,
    pub clock_sync: Arc<ClockSync>,
    pub gateway: Arc<MarketGateway>,
}

pub fn harness() -> Harness {
    let exchange = FakeExchange::new();
    let clock = ManualClock::new(START_MILLIS);
    let clock_sync = Arc::new(ClockSync::new(
        exchange.clone(),
        Arc::new(clock.clone()),
        Duration::from_secs(3600),
        1500,
    ));
    let executor = RequestExecutor::new(clock_sync.clone(), 3, Duration::ZERO);
    let gateway = Arc::new(MarketGateway::new(
        exchange.clone(),
        executor,
        Arc::new(clock.clone()),
        Duration::from_secs(3600),
    ));

    Harness {
        exchange,
        clock,
        clock_sync,
        gateway,
    }
}
