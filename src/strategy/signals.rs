use super::Strategy;
use crate::indicators::annotate_moving_averages;
use crate::models::{Candle, Signal};
use thiserror::Error;

pub const SHORT_MA_PERIOD: usize = 20;
pub const LONG_MA_PERIOD: usize = 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("insufficient history: have {have} candles, need {need}")]
    InsufficientHistory { have: usize, need: usize },
}

/// Configuration for signal generation
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Candle bodies at or beyond this fraction of the open are ignored
    pub max_body_ratio: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            max_body_ratio: 0.04,
        }
    }
}

/// Evaluate one candle whose moving averages are already filled in
///
/// Long: close > MA60 > MA20 > open. Short: close < MA60 < MA20 < open.
/// Both require |close - open| / open strictly below the body limit.
pub fn evaluate_candle(candle: &Candle, config: &SignalConfig) -> Option<Signal> {
    let (ma20, ma60) = (candle.ma20?, candle.ma60?);

    if candle.open <= 0.0 {
        return None;
    }

    let body_ratio = (candle.close - candle.open).abs() / candle.open;
    if body_ratio >= config.max_body_ratio {
        return None;
    }

    if candle.close > ma60 && ma60 > ma20 && ma20 > candle.open {
        Some(Signal::Long)
    } else if candle.close < ma60 && ma60 < ma20 && ma20 < candle.open {
        Some(Signal::Short)
    } else {
        None
    }
}

/// Ordered moving-average trend on hourly candles
///
/// Evaluates the last candle of the series against its MA20/MA60.
#[derive(Debug, Clone, Default)]
pub struct MaTrendStrategy {
    config: SignalConfig,
}

impl MaTrendStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

impl Strategy for MaTrendStrategy {
    fn generate_signal(&self, candles: &[Candle]) -> Result<Option<Signal>, SignalError> {
        let have = candles.len();
        if have < SHORT_MA_PERIOD {
            return Err(SignalError::InsufficientHistory {
                have,
                need: SHORT_MA_PERIOD,
            });
        }
        if have < LONG_MA_PERIOD {
            return Err(SignalError::InsufficientHistory {
                have,
                need: LONG_MA_PERIOD,
            });
        }

        let mut candles = candles.to_vec();
        annotate_moving_averages(&mut candles);

        Ok(candles
            .last()
            .and_then(|latest| evaluate_candle(latest, &self.config)))
    }

    fn name(&self) -> &str {
        "MA Trend"
    }

    fn min_candles_required(&self) -> usize {
        LONG_MA_PERIOD
    }
}
