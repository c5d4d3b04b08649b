//! Relay node
//!
//! Bridges producer telemetry to the execution node, re-publishes execution
//! media to the producer and pairs the two for the episode recorder.

pub mod bridge;
pub mod pairing;

pub use bridge::{LegState, Relay, RelayStats};
pub use pairing::Pairer;
