use super::Clock;
use crate::error::ExchangeError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Anything that can report the exchange's current time in milliseconds
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn server_time_millis(&self) -> Result<i64, ExchangeError>;
}

/// Snapshot of the local/exchange clock alignment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    /// exchange time - local receive time + half round trip
    pub offset_millis: i64,
    /// Local time at which the last successful sample was received
    pub last_sync_at_millis: i64,
    pub synced: bool,
}

#[derive(Debug, Default)]
struct Slot {
    state: ClockState,
    /// Local send time of the sample currently stored
    sample_sent_at_millis: i64,
}

/// Keeps locally generated request timestamps inside the exchange's window
///
/// Syncs on demand (first use, stale offset, or a -1021 rejection) and from
/// an optional background task. Samples are applied under a mutex and a
/// sample that was sent before the stored one is discarded, so a slow sync
/// can never overwrite a fresher result.
pub struct ClockSync {
    source: Arc<dyn TimeSource>,
    clock: Arc<dyn Clock>,
    sync_interval: Duration,
    max_offset_ms: i64,
    slot: Mutex<Slot>,
}

impl ClockSync {
    pub fn new(
        source: Arc<dyn TimeSource>,
        clock: Arc<dyn Clock>,
        sync_interval: Duration,
        max_offset_ms: i64,
    ) -> Self {
        Self {
            source,
            clock,
            sync_interval,
            max_offset_ms,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn state(&self) -> ClockState {
        self.lock_slot().state
    }

    pub fn offset_millis(&self) -> i64 {
        self.state().offset_millis
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// Query the exchange time once and store the resulting offset
    ///
    /// Never fails: on error the previous offset and synced flag are kept
    /// and the failure is logged. Returns whether a new sample was stored.
    pub async fn sync(&self) -> bool {
        let sent_at = self.clock.now_millis();

        let server_time = match self.source.server_time_millis().await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Clock sync failed, keeping previous offset: {}", e);
                return false;
            }
        };

        let received_at = self.clock.now_millis();
        let applied = self.apply_sample(sent_at, received_at, server_time);

        if applied {
            let offset = self.offset_millis();
            if offset.abs() > self.max_offset_ms {
                tracing::warn!(
                    offset_ms = offset,
                    max_offset_ms = self.max_offset_ms,
                    "Clock synced, offset exceeds tolerated skew"
                );
            } else {
                tracing::info!(offset_ms = offset, "Clock synced");
            }
        } else {
            tracing::debug!("Discarded clock sample older than the stored one");
        }

        applied
    }

    fn apply_sample(&self, sent_at: i64, received_at: i64, server_time: i64) -> bool {
        let half_round_trip = (received_at - sent_at).max(0) / 2;
        let offset = server_time - received_at + half_round_trip;

        let mut slot = self.lock_slot();
        if slot.state.synced && sent_at < slot.sample_sent_at_millis {
            return false;
        }

        slot.state = ClockState {
            offset_millis: offset,
            last_sync_at_millis: received_at,
            synced: true,
        };
        slot.sample_sent_at_millis = sent_at;
        true
    }

    fn needs_sync(&self, now_millis: i64) -> bool {
        let state = self.state();
        !state.synced
            || now_millis - state.last_sync_at_millis > self.sync_interval.as_millis() as i64
    }

    /// Local time shifted onto the exchange clock, syncing first if the
    /// offset was never measured or is older than the sync interval
    pub async fn synced_timestamp(&self) -> i64 {
        if self.needs_sync(self.clock.now_millis()) {
            tracing::debug!("Clock offset missing or stale, syncing before stamping");
            self.sync().await;
        }

        self.clock.now_millis() + self.offset_millis()
    }

    /// Spawn the periodic re-sync task
    ///
    /// The task only ever touches the offset slot. Dropping the returned
    /// handle stops it.
    pub fn spawn_periodic(self: &Arc<Self>) -> SyncHandle {
        let this = Arc::clone(self);
        let period = self.sync_interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                this.sync().await;
            }
        });

        SyncHandle { handle }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        // The slot is plain data; a panic elsewhere cannot leave it half-written
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owner of the background sync task
pub struct SyncHandle {
    handle: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
