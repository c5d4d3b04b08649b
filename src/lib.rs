//! Teleop Bridge - relay, stream synchronization and episode recording for
//! IMU teleoperation.
//!
//! The producer node turns IMU samples into pose telemetry and sends it to a
//! simulation consumer and to the relay. The relay forwards commands to the
//! execution node, re-publishes its camera and audio stream back to the
//! producer and records paired episodes.

pub mod audio;
pub mod config;
pub mod media;
pub mod producer;
pub mod recorder;
pub mod relay;
pub mod telemetry;
pub mod transport;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "teleop_bridge=debug,info";

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
