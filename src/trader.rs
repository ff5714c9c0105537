use crate::config::TradingConfig;
use crate::error::ErrorKind;
use crate::execution::{ReconcileReport, StopLossManager, TrailingUpdate};
use crate::gateway::MarketGateway;
use crate::models::PositionSide;
use crate::strategy::{SignalError, Strategy};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Symbols currently eligible for new entries
///
/// Replaced wholesale on refresh, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    symbols: Vec<String>,
}

impl WatchList {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Counters from one minute-59 pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub positions: usize,
    pub stops_trailed: usize,
    pub unprotected: usize,
    pub signals: usize,
    pub entries: usize,
}

/// The trading cycle: account setup, reconciliation, watch list, strategy
pub struct Trader {
    lifecycle: StopLossManager,
    strategy: Box<dyn Strategy>,
    config: TradingConfig,
    watch_list: WatchList,
}

impl Trader {
    pub fn new(
        gateway: Arc<MarketGateway>,
        strategy: Box<dyn Strategy>,
        config: TradingConfig,
    ) -> Self {
        Self {
            lifecycle: StopLossManager::new(gateway),
            strategy,
            config,
            watch_list: WatchList::default(),
        }
    }

    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    pub fn lifecycle(&self) -> &StopLossManager {
        &self.lifecycle
    }

    fn gateway(&self) -> &Arc<MarketGateway> {
        self.lifecycle.gateway()
    }

    /// Account setup, balance report, first watch list and optional reconcile
    pub async fn startup(&mut self, reconcile: bool) -> Result<()> {
        self.setup_account().await;

        match self.gateway().usdt_balance().await {
            Ok(balance) => tracing::info!("💰 Account balance: {:.2} USDT", balance),
            Err(e) => tracing::warn!("Balance unavailable: {}", e),
        }

        self.refresh_watch_list().await;
        tracing::info!("Watching {} symbols", self.watch_list.len());

        if reconcile {
            self.reconcile_pass()
                .await
                .context("startup reconciliation")?;
        }

        Ok(())
    }

    /// Switch the account to one-way position mode if needed
    pub async fn setup_account(&self) {
        match self.gateway().is_dual_side_position().await {
            Ok(false) => tracing::info!("Account already in one-way mode"),
            Ok(true) => match self.gateway().set_one_way_mode().await {
                Ok(()) => tracing::info!("Switched account to one-way mode"),
                Err(e) if e.kind() == ErrorKind::NoOp => {
                    tracing::info!("Account already in one-way mode")
                }
                Err(e) => tracing::warn!("Position mode not changed: {}", e),
            },
            Err(e) => tracing::warn!("Position mode unavailable: {}", e),
        }
    }

    /// Minute 57
    pub async fn reconcile_pass(&mut self) -> Result<ReconcileReport> {
        self.lifecycle.reconcile().await
    }

    /// Minute 58: rebuild the watch list; an empty result keeps the old one
    pub async fn refresh_watch_list(&mut self) {
        let fetched = self
            .gateway()
            .top_volume_symbols(self.config.watch_list_size, &self.config.exclude_symbols)
            .await;

        match fetched {
            Ok(symbols) if !symbols.is_empty() => {
                tracing::info!("Watch list updated: {:?}", symbols);
                self.watch_list = WatchList::new(symbols);
            }
            Ok(_) => tracing::warn!("Watch list refresh returned nothing, keeping previous list"),
            Err(e) => tracing::warn!("Watch list refresh failed, keeping previous list: {}", e),
        }
    }

    /// Minute 59: trail stops on open positions, then look for entries
    pub async fn strategy_pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();

        let positions = self.gateway().open_positions().await;
        match positions {
            Ok(positions) => {
                summary.positions = positions.len();
                for position in positions {
                    let Some(side) = position.side() else {
                        continue;
                    };
                    match self
                        .lifecycle
                        .update_trailing_stop(&position.symbol, side, position.entry_price)
                        .await
                    {
                        TrailingUpdate::Replaced { .. } => summary.stops_trailed += 1,
                        TrailingUpdate::Unprotected => summary.unprotected += 1,
                        TrailingUpdate::Skipped | TrailingUpdate::Unchanged => {}
                    }
                }
            }
            Err(e) => tracing::warn!("Positions unavailable, trailing skipped: {}", e),
        }

        let watch_list = self.watch_list.clone();
        for symbol in watch_list.symbols() {
            match self.evaluate_symbol(symbol).await {
                Ok(Some(true)) => {
                    summary.signals += 1;
                    summary.entries += 1;
                }
                Ok(Some(false)) => summary.signals += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(symbol = %symbol, "Entry failed: {:#}", e),
            }
        }

        tracing::info!(
            "Strategy pass: {} positions, {} stops trailed, {} signals, {} entries",
            summary.positions,
            summary.stops_trailed,
            summary.signals,
            summary.entries
        );

        summary
    }

    /// `None` for no signal, otherwise whether an entry was made
    async fn evaluate_symbol(&mut self, symbol: &str) -> Result<Option<bool>> {
        let candles = match self
            .gateway()
            .closed_hourly_candles(symbol, self.config.kline_limit)
            .await
        {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

        let signal = match self.strategy.generate_signal(&candles) {
            Ok(Some(signal)) => signal,
            Ok(None) => return Ok(None),
            Err(SignalError::InsufficientHistory { have, need }) => {
                tracing::warn!(symbol = %symbol, "{} candles, {} needed; skipped", have, need);
                return Ok(None);
            }
        };

        let side = signal.side();
        tracing::info!(symbol = %symbol, "🎯 {} signal ({})", side, self.strategy.name());

        let check = self
            .lifecycle
            .ensure_no_conflicting_position(symbol, side)
            .await;
        if !check.allows_entry() {
            tracing::info!(symbol = %symbol, "Entry refused: {:?}", check);
            return Ok(Some(false));
        }

        let (margin, leverage) = match side {
            PositionSide::Long => (self.config.long_margin, self.config.long_leverage),
            PositionSide::Short => (self.config.short_margin, self.config.short_leverage),
        };

        // Signal candle: the last closed hour
        let Some(candle) = candles.last() else {
            return Ok(Some(false));
        };

        let order = self
            .lifecycle
            .enter(symbol, side, margin, leverage, candle)
            .await?;

        Ok(Some(order.is_some()))
    }
}
