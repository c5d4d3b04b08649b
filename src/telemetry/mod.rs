//! Telemetry
//!
//! The canonical frame, its wire encodings, source liveness, the dual-encoder
//! publisher and producer-side diagnostics.

pub mod diagnostics;
pub mod frame;
pub mod liveness;
pub mod publisher;
pub mod wire;

pub use diagnostics::{Diagnostics, MediaReceiveStats, PoseSnapshot};
pub use frame::{EulerAngles, SourceEuler, TelemetryError, TelemetryFrame};
pub use liveness::{LivenessTracker, SourceLiveness};
pub use publisher::{DualPublisher, FrameSource, PublishStats, TickOutcome};
pub use wire::{ExecutionCommand, RelayTelemetry, SimulationMessage, WireError};
