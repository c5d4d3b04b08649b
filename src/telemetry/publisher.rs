//! Dual-encoder publisher
//!
//! Every tick checks liveness, builds one `TelemetryFrame` and sends it twice:
//! JSON to the simulation leg and MessagePack to the relay leg. The legs are
//! independent sinks; a failing or full leg is counted and logged and never
//! affects the other one.

use super::diagnostics::Diagnostics;
use super::frame::TelemetryFrame;
use super::wire::{RelayTelemetry, SimulationMessage};
use crate::transport::MessageSink;
use crate::utils::{unix_now, Shutdown};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Where ticks get their data
pub trait FrameSource: Send + Sync {
    /// Liveness gate evaluated right before a tick
    fn all_online(&self, now: f64) -> bool;

    /// Current frame, or `None` when no pose can be computed yet
    fn frame(&self, now: f64) -> Option<TelemetryFrame>;
}

/// Result of one publish tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published { relay_sent: bool, simulation_sent: bool },
    SkippedOffline,
    SkippedNoPose,
}

/// Publish counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStats {
    pub ticks: u64,
    pub published: u64,
    pub skipped: u64,
    pub relay_failures: u64,
    pub simulation_failures: u64,
    pub encode_failures: u64,
}

#[derive(Debug, Default)]
struct PublishCounters {
    ticks: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    relay_failures: AtomicU64,
    simulation_failures: AtomicU64,
    encode_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct DualPublisher {
    relay: Arc<dyn MessageSink>,
    simulation: Option<Arc<dyn MessageSink>>,
    strict_gating: bool,
    counters: PublishCounters,
    diagnostics: Arc<Diagnostics>,
}

impl DualPublisher {
    pub fn new(
        relay: Arc<dyn MessageSink>,
        simulation: Option<Arc<dyn MessageSink>>,
        strict_gating: bool,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            relay,
            simulation,
            strict_gating,
            counters: PublishCounters::default(),
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Run one gated tick
    pub fn tick(&self, source: &dyn FrameSource, now: f64) -> TickOutcome {
        bump(&self.counters.ticks);

        if self.strict_gating && !source.all_online(now) {
            bump(&self.counters.skipped);
            tracing::trace!("Publish tick skipped: sources offline");
            return TickOutcome::SkippedOffline;
        }

        match source.frame(now) {
            Some(frame) => self.publish(&frame),
            None => {
                bump(&self.counters.skipped);
                tracing::trace!("Publish tick skipped: no pose");
                TickOutcome::SkippedNoPose
            }
        }
    }

    /// Encode and send one frame on both legs
    pub fn publish(&self, frame: &TelemetryFrame) -> TickOutcome {
        let relay_sent = match RelayTelemetry::from_frame(frame).encode() {
            Ok(payload) => self.send_leg(self.relay.as_ref(), payload, &self.counters.relay_failures),
            Err(e) => {
                bump(&self.counters.encode_failures);
                tracing::error!("Failed to encode relay telemetry: {}", e);
                false
            }
        };

        let simulation_sent = match &self.simulation {
            Some(sink) => match SimulationMessage::from_frame(frame).encode() {
                Ok(payload) => self.send_leg(sink.as_ref(), payload, &self.counters.simulation_failures),
                Err(e) => {
                    bump(&self.counters.encode_failures);
                    tracing::error!("Failed to encode simulation telemetry: {}", e);
                    false
                }
            },
            None => false,
        };

        bump(&self.counters.published);
        self.diagnostics.record_publish(frame);

        TickOutcome::Published {
            relay_sent,
            simulation_sent,
        }
    }

    fn send_leg(&self, sink: &dyn MessageSink, payload: bytes::Bytes, failures: &AtomicU64) -> bool {
        match sink.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                // Queue-full floods are expected while a consumer is away
                if count.is_power_of_two() {
                    tracing::warn!("Send on {} failed ({} total): {}", sink.name(), count, e);
                } else {
                    tracing::trace!("Send on {} failed: {}", sink.name(), e);
                }
                false
            }
        }
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            relay_failures: self.counters.relay_failures.load(Ordering::Relaxed),
            simulation_failures: self.counters.simulation_failures.load(Ordering::Relaxed),
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
        }
    }

    /// Tick at `interval` until shutdown, logging a summary every
    /// `status_interval`
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn FrameSource>,
        interval: Duration,
        status_interval: Duration,
        shutdown: Shutdown,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = tokio::time::interval(status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Publish loop started ({:?} interval)", interval);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    self.tick(source.as_ref(), unix_now());
                }
                _ = status.tick() => self.log_status(),
            }
        }

        tracing::info!("Publish loop stopped");
    }

    fn log_status(&self) {
        let stats = self.stats();
        let rate = self.diagnostics.sample_publish_rate(unix_now());
        let media = self.diagnostics.media_stats();
        tracing::info!(
            "Publish: {:.1} Hz, published {}, skipped {}, relay failures {}, simulation failures {} | media: bundles {}, frames {}, audio {}, decode errors {}, latency {:?}",
            rate.unwrap_or(0.0),
            stats.published,
            stats.skipped,
            stats.relay_failures,
            stats.simulation_failures,
            media.bundles_received,
            media.video_frames,
            media.audio_segments,
            media.decode_errors,
            media.last_latency_secs
        );
    }
}
