use super::sizing::{size_order, stop_price};
use crate::gateway::MarketGateway;
use crate::models::{
    Candle, MarketOrderRequest, OrderInfo, OrderStatus, OrderType, Position, PositionSide,
    StopMarketRequest,
};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Hourly move (percent) a position must make in its favour before the stop trails
pub const TRAILING_TRIGGER_PCT: f64 = 1.0;

/// symbol -> id of the protective stop order believed live for it
///
/// At most one binding per symbol. This is a cache of exchange state and
/// is corrected by [`StopLossManager::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopBindings {
    inner: HashMap<String, i64>,
}

impl StopBindings {
    pub fn get(&self, symbol: &str) -> Option<i64> {
        self.inner.get(symbol).copied()
    }

    /// Bind `order_id` to `symbol`, returning the id it replaced
    pub fn bind(&mut self, symbol: &str, order_id: i64) -> Option<i64> {
        self.inner.insert(symbol.to_string(), order_id)
    }

    pub fn clear(&mut self, symbol: &str) -> Option<i64> {
        self.inner.remove(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.inner.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.inner.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Outcome of checking a symbol before a new entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryCheck {
    /// No open position
    Clear,
    /// An opposite position was closed and its stops cancelled
    ClosedOpposite,
    /// Already positioned on the desired side; no pyramiding
    SameSide,
    /// Position state unknown or the opposite position could not be closed
    Blocked { reason: String },
}

impl EntryCheck {
    pub fn allows_entry(&self) -> bool {
        matches!(self, EntryCheck::Clear | EntryCheck::ClosedOpposite)
    }
}

/// Outcome of a trailing-stop evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum TrailingUpdate {
    /// Flat, or inputs unavailable this cycle
    Skipped,
    /// Candle did not move far enough in the position's favour
    Unchanged,
    /// New stop verified live and bound
    Replaced { order_id: i64 },
    /// Old stop cancelled but no verified replacement; position has no binding
    Unprotected,
}

/// Result of cancelling a symbol's protective orders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelOutcome {
    pub cancelled: usize,
    /// Orders whose cancel failed and which the exchange still lists as live
    pub still_live: Vec<OrderInfo>,
}

impl CancelOutcome {
    /// No protective order survived
    pub fn is_clear(&self) -> bool {
        self.still_live.is_empty()
    }
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Bindings removed because the position is flat
    pub closed: Vec<String>,
    /// Unbound positions whose single existing stop was taken over
    pub adopted: Vec<String>,
    /// Positions that received a fresh stop
    pub reprotected: Vec<String>,
    /// Open positions still without a binding after the pass
    pub unprotected: Vec<String>,
    /// Stray protective orders cancelled
    pub strays_cancelled: usize,
}

/// Entry, stop placement, trailing and reconciliation for every symbol
///
/// Owned by the trading loop; nothing else touches the bindings.
pub struct StopLossManager {
    gateway: Arc<MarketGateway>,
    bindings: StopBindings,
}

impl StopLossManager {
    pub fn new(gateway: Arc<MarketGateway>) -> Self {
        Self {
            gateway,
            bindings: StopBindings::default(),
        }
    }

    pub fn bindings(&self) -> &StopBindings {
        &self.bindings
    }

    pub fn gateway(&self) -> &Arc<MarketGateway> {
        &self.gateway
    }

    /// Make sure entering `desired` on `symbol` would not stack or flip blindly
    ///
    /// An opposite position is closed with a reduce-only market order for its
    /// full size and its stops are cancelled. If the close fails, entry is
    /// blocked.
    pub async fn ensure_no_conflicting_position(
        &mut self,
        symbol: &str,
        desired: PositionSide,
    ) -> EntryCheck {
        let position = match self.gateway.position(symbol).await {
            Ok(Some(p)) => p,
            Ok(None) => return EntryCheck::Clear,
            Err(e) => {
                return EntryCheck::Blocked {
                    reason: format!("position unknown: {}", e),
                }
            }
        };

        let Some(current) = position.side() else {
            return EntryCheck::Clear;
        };

        if current == desired {
            tracing::info!(symbol = %symbol, "Already {} - no pyramiding", current);
            return EntryCheck::SameSide;
        }

        tracing::info!(
            symbol = %symbol,
            "Closing {} {} before entering {}",
            current,
            position.quantity(),
            desired
        );

        let close = MarketOrderRequest {
            symbol: symbol.to_string(),
            side: current.exit_side(),
            quantity: position.quantity(),
            reduce_only: true,
        };

        if let Err(e) = self.gateway.place_market_order(&close).await {
            tracing::error!(symbol = %symbol, "Failed to close {} position: {}", current, e);
            return EntryCheck::Blocked {
                reason: format!("close of {} position failed: {}", current, e),
            };
        }

        match self.cancel_associated_orders(symbol).await {
            Ok(outcome) if !outcome.is_clear() => tracing::warn!(
                symbol = %symbol,
                "{} stops of closed position still live",
                outcome.still_live.len()
            ),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Stops of closed position not cancelled: {}", e)
            }
        }

        EntryCheck::ClosedOpposite
    }

    /// Open a position with a market order and protect it
    ///
    /// Returns `Ok(None)` when the margin is too small for the symbol's
    /// minimum quantity.
    pub async fn enter(
        &mut self,
        symbol: &str,
        side: PositionSide,
        margin: Decimal,
        leverage: u32,
        candle: &Candle,
    ) -> Result<Option<OrderInfo>> {
        self.gateway
            .set_leverage(symbol, leverage)
            .await
            .with_context(|| format!("setting {}x leverage on {}", leverage, symbol))?;

        let rules = self
            .gateway
            .symbol_rules(symbol)
            .await?
            .with_context(|| format!("no trading rules for {}", symbol))?;

        let price = self.gateway.latest_price(symbol).await?;

        let Some(quantity) = size_order(margin, leverage, price, &rules) else {
            tracing::warn!(
                symbol = %symbol,
                "Order size below minimum (margin {}, {}x, price {}, min qty {})",
                margin,
                leverage,
                price,
                rules.min_qty
            );
            return Ok(None);
        };

        let order = self
            .gateway
            .place_market_order(&MarketOrderRequest {
                symbol: symbol.to_string(),
                side: side.entry_side(),
                quantity,
                reduce_only: false,
            })
            .await
            .with_context(|| format!("{} market entry on {}", side, symbol))?;

        match self.gateway.latest_price(symbol).await {
            Ok(fill) => tracing::info!(
                symbol = %symbol,
                "📈 Entered {} {} @ ~{} (order {})",
                side,
                quantity,
                fill,
                order.order_id
            ),
            Err(_) => tracing::info!(
                symbol = %symbol,
                "📈 Entered {} {} (order {})",
                side,
                quantity,
                order.order_id
            ),
        }

        if let Err(e) = self.place_initial_stop(symbol, side, candle).await {
            tracing::error!(
                symbol = %symbol,
                "🚨 Entered {} but initial stop failed: {:#}",
                side,
                e
            );
        }

        Ok(Some(order))
    }

    /// Place the first stop for a fresh position
    ///
    /// Long: 0.1% below the entry candle's low. Short: at its high. Existing
    /// protective orders are cancelled first. Returns the bound order id, or
    /// `None` when there is no open position to protect. Fails without
    /// placing anything if an old order survives its cancel; the survivor
    /// stays bound.
    pub async fn place_initial_stop(
        &mut self,
        symbol: &str,
        side: PositionSide,
        candle: &Candle,
    ) -> Result<Option<i64>> {
        if self.gateway.position(symbol).await?.is_none() {
            tracing::warn!(symbol = %symbol, "No open position, initial stop skipped");
            return Ok(None);
        }

        let request = self.stop_request(symbol, side, candle).await?;

        let previous = self.bindings.get(symbol);
        let outcome = self
            .cancel_associated_orders(symbol)
            .await
            .context("clearing previous stops")?;
        if !outcome.is_clear() {
            let kept = self.readopt(symbol, previous, &outcome.still_live);
            anyhow::bail!(
                "{} orders on {} not cancelled (kept {:?}), stop not placed",
                outcome.still_live.len(),
                symbol,
                kept
            );
        }

        let order = self
            .gateway
            .place_stop_market_order(&request)
            .await
            .with_context(|| format!("placing stop for {} {}", side, symbol))?;

        self.bindings.bind(symbol, order.order_id);
        tracing::info!(
            symbol = %symbol,
            "🛡️ Stop {} placed @ {} for {}",
            order.order_id,
            request.stop_price,
            side
        );

        Ok(Some(order.order_id))
    }

    /// Trail the stop behind the current hourly candle
    ///
    /// Acts only when the candle moved at least 1% in the position's favour.
    /// The replacement is computed before the old stop is cancelled, and is
    /// bound only once the exchange reports it live. Nothing is placed while
    /// an old protective order is still live.
    pub async fn update_trailing_stop(
        &mut self,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
    ) -> TrailingUpdate {
        match self.gateway.position(symbol).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(symbol = %symbol, "Flat, trailing update skipped");
                return TrailingUpdate::Skipped;
            }
            Err(_) => return TrailingUpdate::Skipped,
        }

        let candle = match self.gateway.latest_hourly_candle(symbol).await {
            Ok(c) => c,
            Err(_) => return TrailingUpdate::Skipped,
        };

        let change = candle.change_pct();
        let favourable = match side {
            PositionSide::Long => change >= TRAILING_TRIGGER_PCT,
            PositionSide::Short => change <= -TRAILING_TRIGGER_PCT,
        };
        if !favourable {
            tracing::debug!(symbol = %symbol, "Hourly change {:.2}%, stop unchanged", change);
            return TrailingUpdate::Unchanged;
        }

        let request = match self.stop_request(symbol, side, &candle).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Trailing stop not computed: {:#}", e);
                return TrailingUpdate::Skipped;
            }
        };

        tracing::info!(
            symbol = %symbol,
            "Hourly change {:.2}% - trailing {} stop to {} (entry {})",
            change,
            side,
            request.stop_price,
            entry_price
        );

        let previous = self.bindings.get(symbol);
        match self.cancel_associated_orders(symbol).await {
            Ok(outcome) if outcome.is_clear() => {}
            Ok(outcome) => {
                self.readopt(symbol, previous, &outcome.still_live);
                tracing::warn!(
                    symbol = %symbol,
                    "Trailing update aborted: {} protective orders still live",
                    outcome.still_live.len()
                );
                return TrailingUpdate::Skipped;
            }
            Err(e) => {
                // Old stop still in place and bound
                tracing::warn!(symbol = %symbol, "Trailing update aborted: {}", e);
                return TrailingUpdate::Skipped;
            }
        }

        let placed = match self.gateway.place_stop_market_order(&request).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "🚨 UNPROTECTED: replacement stop rejected after cancel: {}",
                    e
                );
                return TrailingUpdate::Unprotected;
            }
        };

        match self.gateway.get_order(symbol, placed.order_id).await {
            Ok(verified) if verified.status == OrderStatus::New => {
                self.bindings.bind(symbol, placed.order_id);
                tracing::info!(
                    symbol = %symbol,
                    "🛡️ Trailing stop {} verified @ {}",
                    placed.order_id,
                    request.stop_price
                );
                TrailingUpdate::Replaced {
                    order_id: placed.order_id,
                }
            }
            Ok(verified) => {
                tracing::error!(
                    symbol = %symbol,
                    "🚨 UNPROTECTED: stop {} reported {:?} instead of NEW",
                    placed.order_id,
                    verified.status
                );
                TrailingUpdate::Unprotected
            }
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "🚨 UNPROTECTED: stop {} could not be verified: {}",
                    placed.order_id,
                    e
                );
                TrailingUpdate::Unprotected
            }
        }
    }

    /// Cancel every stop-market or reduce-only order on `symbol`
    ///
    /// Best effort: the binding is cleared even if individual cancels fail.
    /// Errors only when the open orders could not be listed, in which case
    /// the binding is left alone. Orders whose cancel failed and that the
    /// exchange still lists are returned in [`CancelOutcome::still_live`].
    pub async fn cancel_associated_orders(&mut self, symbol: &str) -> Result<CancelOutcome> {
        let orders = self
            .gateway
            .open_orders(symbol)
            .await
            .with_context(|| format!("listing open orders for {}", symbol))?;

        let mut outcome = CancelOutcome::default();
        let mut failed = Vec::new();
        for order in orders.iter().filter(|o| o.is_protective()) {
            match self.gateway.cancel_order(symbol, order.order_id).await {
                Ok(()) => {
                    outcome.cancelled += 1;
                    tracing::info!(
                        symbol = %symbol,
                        "Cancelled order {} ({:?})",
                        order.order_id,
                        order.order_type
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        "Failed to cancel order {}: {}",
                        order.order_id,
                        e
                    );
                    failed.push(order.clone());
                }
            }
        }

        if !failed.is_empty() {
            outcome.still_live = match self.gateway.open_orders(symbol).await {
                Ok(remaining) => remaining
                    .into_iter()
                    .filter(|o| {
                        o.status.is_live() && failed.iter().any(|f| f.order_id == o.order_id)
                    })
                    .collect(),
                // Unknown: assume every failed cancel left its order live
                Err(_) => failed,
            };
        }

        self.bindings.clear(symbol);
        Ok(outcome)
    }

    /// Rebind a protective stop that survived a failed cancel
    ///
    /// Prefers the previously bound order, then the first surviving
    /// stop-market order.
    fn readopt(
        &mut self,
        symbol: &str,
        previous: Option<i64>,
        still_live: &[OrderInfo],
    ) -> Option<i64> {
        let kept = previous
            .filter(|id| still_live.iter().any(|o| o.order_id == *id))
            .or_else(|| {
                still_live
                    .iter()
                    .find(|o| o.order_type == OrderType::StopMarket)
                    .map(|o| o.order_id)
            })?;
        self.bindings.bind(symbol, kept);
        tracing::warn!(symbol = %symbol, "Stop {} still live, keeping it bound", kept);
        Some(kept)
    }

    /// Bring the bindings back in line with exchange positions and orders
    ///
    /// - bound but flat: the stop filled or the position was closed; clear
    ///   the binding and any leftover protective orders
    /// - bound and open: keep the binding if the order is still live,
    ///   cancel any other protective orders
    /// - unbound and open: adopt a single live stop on the exit side, or
    ///   cancel strays and place a fresh stop from the current hourly candle
    ///
    /// Fails without touching anything if positions cannot be fetched.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let positions = self
            .gateway
            .open_positions()
            .await
            .context("fetching positions for reconciliation")?;

        let mut report = ReconcileReport::default();
        let open: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();

        for symbol in self.bindings.symbols() {
            if open.contains(symbol.as_str()) {
                continue;
            }
            tracing::info!(symbol = %symbol, "Position closed, stop filled or removed");
            match self.cancel_associated_orders(&symbol).await {
                Ok(outcome) if !outcome.is_clear() => tracing::warn!(
                    symbol = %symbol,
                    "{} leftover orders still live",
                    outcome.still_live.len()
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol = %symbol, "Leftover orders not cleaned: {:#}", e),
            }
            self.bindings.clear(&symbol);
            report.closed.push(symbol);
        }

        for position in &positions {
            if let Err(e) = self.reconcile_position(position, &mut report).await {
                tracing::error!(
                    symbol = %position.symbol,
                    "🚨 Reconciliation failed: {:#}",
                    e
                );
            }
            if !self.bindings.contains(&position.symbol) {
                report.unprotected.push(position.symbol.clone());
            }
        }

        if report.unprotected.is_empty() {
            tracing::info!(
                "Reconciled {} open positions ({} closed, {} re-protected)",
                positions.len(),
                report.closed.len(),
                report.reprotected.len()
            );
        } else {
            tracing::error!(
                "🚨 Positions without a protective stop: {:?}",
                report.unprotected
            );
        }

        Ok(report)
    }

    async fn reconcile_position(
        &mut self,
        position: &Position,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let symbol = position.symbol.as_str();
        let Some(side) = position.side() else {
            return Ok(());
        };

        let orders = self.gateway.open_orders(symbol).await?;
        let protective: Vec<&OrderInfo> = orders
            .iter()
            .filter(|o| o.is_protective() && o.status.is_live())
            .collect();

        let keep = match self.bindings.get(symbol) {
            Some(bound)
                if protective
                    .iter()
                    .any(|o| o.order_id == bound && o.side == side.exit_side()) =>
            {
                Some(bound)
            }
            Some(stale) => {
                tracing::warn!(
                    symbol = %symbol,
                    "Bound stop {} no longer open on the {} exit side",
                    stale,
                    side
                );
                self.bindings.clear(symbol);
                None
            }
            None => None,
        };

        let keep = keep.or_else(|| {
            let candidates: Vec<&&OrderInfo> = protective
                .iter()
                .filter(|o| o.order_type == OrderType::StopMarket && o.side == side.exit_side())
                .collect();
            match candidates.as_slice() {
                [only] => {
                    self.bindings.bind(symbol, only.order_id);
                    report.adopted.push(symbol.to_string());
                    tracing::info!(symbol = %symbol, "Adopted existing stop {}", only.order_id);
                    Some(only.order_id)
                }
                _ => None,
            }
        });

        if let Some(kept) = keep {
            for stray in protective.iter().filter(|o| o.order_id != kept) {
                match self.gateway.cancel_order(symbol, stray.order_id).await {
                    Ok(()) => {
                        report.strays_cancelled += 1;
                        tracing::info!(symbol = %symbol, "Cancelled stray order {}", stray.order_id);
                    }
                    Err(e) => tracing::warn!(
                        symbol = %symbol,
                        "Failed to cancel stray order {}: {}",
                        stray.order_id,
                        e
                    ),
                }
            }
            return Ok(());
        }

        tracing::warn!(symbol = %symbol, "Open {} position has no stop, re-protecting", side);
        let candle = self.gateway.latest_hourly_candle(symbol).await?;
        if self.place_initial_stop(symbol, side, &candle).await?.is_some() {
            report.reprotected.push(symbol.to_string());
        }

        Ok(())
    }

    async fn stop_request(
        &self,
        symbol: &str,
        side: PositionSide,
        candle: &Candle,
    ) -> Result<StopMarketRequest> {
        let rules = self
            .gateway
            .symbol_rules(symbol)
            .await?
            .with_context(|| format!("no trading rules for {}", symbol))?;

        let stop_price = stop_price(side, candle, rules.price_precision)
            .with_context(|| format!("unusable candle for {} stop", symbol))?;

        Ok(StopMarketRequest {
            symbol: symbol.to_string(),
            side: side.exit_side(),
            stop_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_hold_one_order_per_symbol() {
        let mut bindings = StopBindings::default();
        assert_eq!(bindings.bind("ADAUSDT", 1), None);
        assert_eq!(bindings.bind("ADAUSDT", 2), Some(1));
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.get("ADAUSDT"), Some(2));

        bindings.bind("DOTUSDT", 3);
        assert_eq!(bindings.symbols(), vec!["ADAUSDT", "DOTUSDT"]);

        assert_eq!(bindings.clear("ADAUSDT"), Some(2));
        assert!(!bindings.contains("ADAUSDT"));
        assert_eq!(bindings.clear("ADAUSDT"), None);
    }

    #[test]
    fn test_entry_check_allows() {
        assert!(EntryCheck::Clear.allows_entry());
        assert!(EntryCheck::ClosedOpposite.allows_entry());
        assert!(!EntryCheck::SameSide.allows_entry());
        assert!(!EntryCheck::Blocked {
            reason: "x".into()
        }
        .allows_entry());
    }
}
