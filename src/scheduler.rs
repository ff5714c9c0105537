use crate::clock::Clock;
use crate::trader::Trader;
use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub const TICK: Duration = Duration::from_secs(1);
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(10);

/// Work bound to a minute of every hour (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledAction {
    /// :57
    Reconcile,
    /// :58
    RefreshWatchList,
    /// :59
    StrategyPass,
}

impl ScheduledAction {
    pub fn for_minute(minute: u32) -> Option<Self> {
        match minute {
            57 => Some(ScheduledAction::Reconcile),
            58 => Some(ScheduledAction::RefreshWatchList),
            59 => Some(ScheduledAction::StrategyPass),
            _ => None,
        }
    }
}

/// Fires each action once per hour, on the first wake inside its minute
///
/// A minute missed entirely (e.g. because the previous action overran) is
/// not made up later.
#[derive(Debug, Default)]
pub struct MinuteSchedule {
    last_fired: Option<(i64, u32)>,
}

impl MinuteSchedule {
    pub fn due(&mut self, now: DateTime<Utc>) -> Option<ScheduledAction> {
        let minute = now.minute();
        let action = ScheduledAction::for_minute(minute)?;

        let key = (now.timestamp().div_euclid(3600), minute);
        if self.last_fired == Some(key) {
            return None;
        }

        self.last_fired = Some(key);
        Some(action)
    }
}

/// Single-task control loop driving the [`Trader`]
pub struct Scheduler {
    trader: Trader,
    clock: Arc<dyn Clock>,
    schedule: MinuteSchedule,
}

impl Scheduler {
    pub fn new(trader: Trader, clock: Arc<dyn Clock>) -> Self {
        Self {
            trader,
            clock,
            schedule: MinuteSchedule::default(),
        }
    }

    pub fn trader(&self) -> &Trader {
        &self.trader
    }

    pub fn trader_mut(&mut self) -> &mut Trader {
        &mut self.trader
    }

    /// Check the clock once and run whatever is due
    pub async fn run_once(&mut self) -> Result<Option<ScheduledAction>> {
        let now = self.clock.now();
        let Some(action) = self.schedule.due(now) else {
            return Ok(None);
        };

        tracing::info!("⏰ {} - {:?}", now.format("%H:%M:%S"), action);

        match action {
            ScheduledAction::Reconcile => {
                self.trader.reconcile_pass().await?;
            }
            ScheduledAction::RefreshWatchList => {
                self.trader.refresh_watch_list().await;
            }
            ScheduledAction::StrategyPass => {
                self.trader.strategy_pass().await;
            }
        }

        Ok(Some(action))
    }

    /// Wake every second until `shutdown` resolves
    ///
    /// A failed cycle is logged and followed by a cooldown.
    pub async fn run<S>(&mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_once().await {
                tracing::error!(
                    "Cycle failed: {:#} - retrying in {}s",
                    e,
                    ERROR_COOLDOWN.as_secs()
                );
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(ERROR_COOLDOWN) => {}
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
