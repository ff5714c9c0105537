// Technical indicators module
pub mod moving_average;

pub use moving_average::{annotate_moving_averages, calculate_sma, rolling_sma};
