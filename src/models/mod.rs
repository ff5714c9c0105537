use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Hourly (or any interval) OHLCV candle
///
/// `ma20` / `ma60` stay `None` until enough history exists to compute them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
}

impl Candle {
    /// Percent change from open to close (e.g. 1.5 means +1.5%)
    pub fn change_pct(&self) -> f64 {
        (self.close - self.open) / self.open * 100.0
    }
}

/// Order side as the exchange understands it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Direction of an open position (one-way mode)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that opens (or adds to) this position
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that reduces this position
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Entry signal produced by a strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    Long,
    Short,
}

impl Signal {
    pub fn side(&self) -> PositionSide {
        match self {
            Signal::Long => PositionSide::Long,
            Signal::Short => PositionSide::Short,
        }
    }
}

/// Exchange-reported position for one symbol
///
/// `amount` is signed: positive for long, negative for short, zero when flat.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub amount: Decimal,
    pub entry_price: f64,
    pub mark_price: f64,
}

impl Position {
    pub fn side(&self) -> Option<PositionSide> {
        if self.amount.is_sign_positive() && !self.amount.is_zero() {
            Some(PositionSide::Long)
        } else if self.amount.is_sign_negative() && !self.amount.is_zero() {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// Absolute position size
    pub fn quantity(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn is_flat(&self) -> bool {
        self.amount.is_zero()
    }
}

/// Per-symbol exchange metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub quote_asset: String,
    pub contract_type: String,
    pub rules: SymbolRules,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

/// Rounding rules used to turn raw quantities/prices into acceptable orders
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub quantity_precision: u32,
    pub price_precision: u32,
}

/// 24h ticker volume (quote asset)
#[derive(Debug, Clone, PartialEq)]
pub struct TickerVolume {
    pub symbol: String,
    pub quote_volume: f64,
}

/// Wallet balance for a single asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetBalance {
    pub asset: String,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    StopMarket,
    Other,
}

impl OrderType {
    pub fn from_exchange(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "MARKET" => OrderType::Market,
            "STOP_MARKET" => OrderType::StopMarket,
            _ => OrderType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    Other,
}

impl OrderStatus {
    pub fn from_exchange(value: &str) -> Self {
        match value {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Other,
        }
    }

    /// Still resting on the book / waiting for its trigger
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::New)
    }
}

/// Order as reported by the exchange (query, open orders, or placement ack)
#[derive(Debug, Clone, PartialEq)]
pub struct OrderInfo {
    pub symbol: String,
    pub order_id: i64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub close_position: bool,
    pub stop_price: Option<Decimal>,
}

impl OrderInfo {
    /// Orders we treat as protective exits for a position
    pub fn is_protective(&self) -> bool {
        self.order_type == OrderType::StopMarket || self.reduce_only
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

/// Stop-market order that closes the whole position when triggered
#[derive(Debug, Clone, PartialEq)]
pub struct StopMarketRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub stop_price: Decimal,
}
