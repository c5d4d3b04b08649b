//! Shared utilities
//!
//! The latest-only slot, clock helpers and the shutdown signal. Errors live
//! with the module that raises them.

pub mod shutdown;
pub mod slot;

pub use shutdown::Shutdown;
pub use slot::LatestSlot;

use chrono::Utc;

/// Current wall-clock time as unix seconds
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
