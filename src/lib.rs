// Core modules
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod scheduler;
pub mod strategy;
pub mod trader;

// Re-export commonly used types
pub use api::FuturesApi;
pub use error::{ErrorKind, ExchangeError};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
