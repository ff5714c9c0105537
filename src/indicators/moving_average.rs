use crate::models::Candle;

/// Calculate Simple Moving Average (SMA) of the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Rolling SMA of closing prices, one entry per candle
///
/// Entry `i` covers candles `i + 1 - period ..= i` and is `None` while
/// fewer than `period` candles are available.
pub fn rolling_sma(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    (0..closes.len())
        .map(|i| calculate_sma(&closes[..=i], period))
        .collect()
}

/// Fill `ma20` and `ma60` on every candle
pub fn annotate_moving_averages(candles: &mut [Candle]) {
    let ma20 = rolling_sma(candles, 20);
    let ma60 = rolling_sma(candles, 60);

    for ((candle, ma20), ma60) in candles.iter_mut().zip(ma20).zip(ma60) {
        candle.ma20 = ma20;
        candle.ma60 = ma60;
    }
}
