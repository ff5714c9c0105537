// Order execution: request retries, sizing, stop-loss lifecycle
pub mod lifecycle;
pub mod request;
pub mod sizing;

pub use lifecycle::{
    CancelOutcome, EntryCheck, ReconcileReport, StopBindings, StopLossManager, TrailingUpdate,
};
pub use request::RequestExecutor;
pub use sizing::{size_order, stop_price};
