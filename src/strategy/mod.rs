// Trading strategy module
pub mod signals;

pub use signals::{MaTrendStrategy, SignalConfig, SignalError};

use crate::models::{Candle, Signal};

/// Base trait for entry strategies
pub trait Strategy: Send + Sync {
    /// Entry signal for the latest candle of `candles` (oldest first)
    ///
    /// `Ok(None)` means the series was evaluated and nothing triggered.
    fn generate_signal(&self, candles: &[Candle]) -> Result<Option<Signal>, SignalError>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
