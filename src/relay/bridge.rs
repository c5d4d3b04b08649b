//! Relay bridge
//!
//! Two independent legs. Command leg: binary telemetry from the producer is
//! decoded, validated, re-encoded as an execution command and forwarded on a
//! queued channel. Media leg: bundles from the execution node are re-wrapped
//! and published on the broadcast channel. Both legs tap the recorder through
//! a latest-only slot so recording never adds forwarding latency.

use super::pairing::Pairer;
use crate::media::{MediaBroadcast, MediaBundle};
use crate::recorder::RecordTap;
use crate::telemetry::{ExecutionCommand, RelayTelemetry, WireError};
use crate::transport::{MessageSink, QueuedReceiver};
use crate::utils::{unix_now, Shutdown};
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Where a leg is in handling its current message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LegState {
    Waiting,
    MessageReceived,
    ReEncoded,
    Forwarded,
}

impl LegState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::MessageReceived,
            2 => Self::ReEncoded,
            3 => Self::Forwarded,
            _ => Self::Waiting,
        }
    }
}

#[derive(Debug, Default)]
struct LegTracker(AtomicU8);

impl LegTracker {
    fn set(&self, state: LegState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> LegState {
        LegState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Relay counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub commands_received: u64,
    pub commands_forwarded: u64,
    pub commands_rejected: u64,
    pub forward_failures: u64,
    pub bundles_received: u64,
    pub bundles_published: u64,
    pub bundles_rejected: u64,
    pub publish_failures: u64,
    pub paired: u64,
    pub unpaired: u64,
    pub episode_ends: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    commands_received: AtomicU64,
    commands_forwarded: AtomicU64,
    commands_rejected: AtomicU64,
    forward_failures: AtomicU64,
    bundles_received: AtomicU64,
    bundles_published: AtomicU64,
    bundles_rejected: AtomicU64,
    publish_failures: AtomicU64,
    episode_ends: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

pub struct Relay {
    /// Execution-node command channel
    execution: Arc<dyn MessageSink>,

    /// Media broadcast back to the producer
    broadcast: Arc<dyn MessageSink>,

    pairer: ParkingMutex<Pairer>,
    tap: Option<Arc<RecordTap>>,

    command_leg: LegTracker,
    media_leg: LegTracker,
    counters: RelayCounters,
}

impl Relay {
    /// `max_pair_skew` in seconds
    pub fn new(execution: Arc<dyn MessageSink>, broadcast: Arc<dyn MessageSink>, max_pair_skew: f64) -> Self {
        Self {
            execution,
            broadcast,
            pairer: ParkingMutex::new(Pairer::new(max_pair_skew)),
            tap: None,
            command_leg: LegTracker::default(),
            media_leg: LegTracker::default(),
            counters: RelayCounters::default(),
        }
    }

    /// Feed paired samples to a recorder
    pub fn with_recorder_tap(mut self, tap: Arc<RecordTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn command_state(&self) -> LegState {
        self.command_leg.get()
    }

    pub fn media_state(&self) -> LegState {
        self.media_leg.get()
    }

    pub fn stats(&self) -> RelayStats {
        let pairer = self.pairer.lock();
        RelayStats {
            commands_received: self.counters.commands_received.load(Ordering::Relaxed),
            commands_forwarded: self.counters.commands_forwarded.load(Ordering::Relaxed),
            commands_rejected: self.counters.commands_rejected.load(Ordering::Relaxed),
            forward_failures: self.counters.forward_failures.load(Ordering::Relaxed),
            bundles_received: self.counters.bundles_received.load(Ordering::Relaxed),
            bundles_published: self.counters.bundles_published.load(Ordering::Relaxed),
            bundles_rejected: self.counters.bundles_rejected.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            paired: pairer.paired(),
            unpaired: pairer.unpaired(),
            episode_ends: self.counters.episode_ends.load(Ordering::Relaxed),
        }
    }

    /// Decode one producer message and forward it to the execution node.
    ///
    /// A send failure is logged and counted; only decode failures are
    /// returned.
    pub fn handle_command(&self, raw: &[u8]) -> Result<ExecutionCommand, WireError> {
        self.command_leg.set(LegState::MessageReceived);
        bump(&self.counters.commands_received);

        let reencoded = RelayTelemetry::decode(raw).and_then(|telemetry| {
            let command = ExecutionCommand::from_relay(&telemetry);
            let payload = command.encode()?;
            Ok((telemetry, command, payload))
        });
        let (telemetry, command, payload) = match reencoded {
            Ok(parts) => parts,
            Err(e) => {
                bump(&self.counters.commands_rejected);
                self.command_leg.set(LegState::Waiting);
                return Err(e);
            }
        };
        self.command_leg.set(LegState::ReEncoded);

        if self.tap.is_some() {
            self.pairer.lock().observe(telemetry);
        }

        match self.execution.try_send(payload) {
            Ok(()) => {
                bump(&self.counters.commands_forwarded);
            }
            Err(e) => {
                let failures = bump(&self.counters.forward_failures);
                if failures.is_power_of_two() {
                    tracing::warn!("Forward to {} failed ({} total): {}", self.execution.name(), failures, e);
                }
            }
        }
        self.command_leg.set(LegState::Forwarded);
        self.command_leg.set(LegState::Waiting);

        Ok(command)
    }

    /// Decode one bundle, tap the recorder and re-publish it. Returns the
    /// bundle's sequence number.
    pub fn handle_media(&self, raw: &[u8]) -> Result<u64, WireError> {
        self.media_leg.set(LegState::MessageReceived);
        bump(&self.counters.bundles_received);

        let bundle = match MediaBundle::decode(raw) {
            Ok(bundle) => bundle,
            Err(e) => {
                bump(&self.counters.bundles_rejected);
                self.media_leg.set(LegState::Waiting);
                return Err(e);
            }
        };
        let sequence = bundle.sequence;

        if let Some(tap) = &self.tap {
            if let Some(sample) = self.pairer.lock().pair(&bundle) {
                tap.offer(sample);
            }
            if bundle.ends_episode() {
                bump(&self.counters.episode_ends);
                tap.request_episode_end();
                tracing::info!("Episode end requested by bundle {}", sequence);
            }
        }

        let payload = match MediaBroadcast::wrap(bundle, unix_now()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                bump(&self.counters.bundles_rejected);
                self.media_leg.set(LegState::Waiting);
                return Err(e);
            }
        };
        self.media_leg.set(LegState::ReEncoded);

        match self.broadcast.try_send(payload) {
            Ok(()) => {
                bump(&self.counters.bundles_published);
            }
            Err(e) => {
                let failures = bump(&self.counters.publish_failures);
                if failures.is_power_of_two() {
                    tracing::warn!("Publish on {} failed ({} total): {}", self.broadcast.name(), failures, e);
                }
            }
        }
        self.media_leg.set(LegState::Forwarded);
        self.media_leg.set(LegState::Waiting);

        Ok(sequence)
    }

    /// Command leg loop
    pub async fn run_commands(self: Arc<Self>, mut receiver: QueuedReceiver) {
        tracing::info!("Command leg started on {}", receiver.name());
        while let Some(raw) = receiver.recv().await {
            if let Err(e) = self.handle_command(&raw) {
                tracing::warn!("Dropped malformed command ({} bytes): {}", raw.len(), e);
            }
        }
        tracing::info!("Command leg stopped");
    }

    /// Media leg loop
    pub async fn run_media(self: Arc<Self>, mut receiver: QueuedReceiver) {
        tracing::info!("Media leg started on {}", receiver.name());
        while let Some(raw) = receiver.recv().await {
            if let Err(e) = self.handle_media(&raw) {
                tracing::warn!("Dropped malformed bundle ({} bytes): {}", raw.len(), e);
            }
        }
        tracing::info!("Media leg stopped");
    }

    /// Log a status line every `interval` until shutdown
    pub async fn run_status(self: Arc<Self>, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let stats = self.stats();
                    tracing::info!(
                        "Relay: commands {}/{} forwarded ({} rejected, {} failed) | bundles {}/{} published ({} rejected, {} failed) | paired {}, unpaired {}",
                        stats.commands_forwarded,
                        stats.commands_received,
                        stats.commands_rejected,
                        stats.forward_failures,
                        stats.bundles_published,
                        stats.bundles_received,
                        stats.bundles_rejected,
                        stats.publish_failures,
                        stats.paired,
                        stats.unpaired
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryFrame;
    use crate::transport::MemorySink;

    fn relay_message(capture_time: f64) -> Vec<u8> {
        let frame = TelemetryFrame::new([0.30, 0.0, 0.25], [0.1, -0.2, 0.0], 0.5, vec![], capture_time).unwrap();
        RelayTelemetry::from_frame(&frame).encode().unwrap().to_vec()
    }

    fn relay() -> (Relay, Arc<MemorySink>, Arc<MemorySink>) {
        let execution = Arc::new(MemorySink::new("execution"));
        let broadcast = Arc::new(MemorySink::new("broadcast"));
        let relay = Relay::new(execution.clone(), broadcast.clone(), 0.5);
        (relay, execution, broadcast)
    }

    #[test]
    fn test_command_is_reencoded_and_forwarded() {
        let (relay, execution, _) = relay();

        let command = relay.handle_command(&relay_message(12.5)).unwrap();
        assert_eq!(command.msg_type, "control");
        assert_eq!(command.timestamp, 12.5);
        assert_eq!(relay.command_state(), LegState::Waiting);

        let sent = execution.drain();
        assert_eq!(sent.len(), 1);
        let forwarded = ExecutionCommand::decode(&sent[0]).unwrap();
        assert_eq!(forwarded, command);
        assert_eq!(forwarded.position, [0.30, 0.0, 0.25]);
        assert_eq!(forwarded.throttle, 0.0);
    }

    #[test]
    fn test_malformed_command_is_dropped() {
        let (relay, execution, _) = relay();

        assert!(relay.handle_command(b"not msgpack").is_err());

        let mut message = RelayTelemetry::decode(&relay_message(1.0)).unwrap();
        message.msg_type = None;
        let raw = rmp_serde::to_vec_named(&message).unwrap();
        assert!(matches!(relay.handle_command(&raw), Err(WireError::MissingDiscriminator)));

        assert!(execution.is_empty());
        let stats = relay.stats();
        assert_eq!(stats.commands_received, 2);
        assert_eq!(stats.commands_rejected, 2);

        // Still forwarding afterwards
        relay.handle_command(&relay_message(2.0)).unwrap();
        assert_eq!(execution.len(), 1);
    }

    #[test]
    fn test_forward_failure_is_not_an_error() {
        let (relay, execution, _) = relay();
        execution.close();

        assert!(relay.handle_command(&relay_message(1.0)).is_ok());
        let stats = relay.stats();
        assert_eq!(stats.forward_failures, 1);
        assert_eq!(stats.commands_forwarded, 0);
    }

    #[test]
    fn test_media_is_rewrapped_for_broadcast() {
        let (relay, _, broadcast) = relay();
        let bundle = MediaBundle::new(42, 20.0)
            .with_video("left", vec![1u8, 2, 3])
            .with_video("top", vec![1u8, 2, 3]);

        assert_eq!(relay.handle_media(&bundle.encode().unwrap()).unwrap(), 42);

        let sent = broadcast.drain();
        assert_eq!(sent.len(), 1);
        let message = MediaBroadcast::decode(&sent[0]).unwrap();
        assert_eq!(message.sequence, 42);
        assert_eq!(message.capture_time, 20.0);
        assert!(message.relay_time > 0.0);
        assert_eq!(message.video, bundle.video);
    }

    #[test]
    fn test_media_without_subscribers_is_not_queued() {
        let (relay, _, broadcast) = relay();
        broadcast.close();

        let bundle = MediaBundle::new(1, 1.0).with_video("top", vec![9u8]);
        assert!(relay.handle_media(&bundle.encode().unwrap()).is_ok());
        assert_eq!(relay.stats().publish_failures, 1);
        assert_eq!(relay.media_state(), LegState::Waiting);
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        let (relay, _, broadcast) = relay();
        let bundle = MediaBundle::new(1, 1.0);

        assert!(relay.handle_media(&bundle.encode().unwrap()).is_err());
        assert!(broadcast.is_empty());
        assert_eq!(relay.stats().bundles_rejected, 1);
    }

    #[test]
    fn test_pairs_feed_recorder_tap() {
        let (relay, _, _) = relay();
        let tap = Arc::new(RecordTap::new());
        let relay = relay.with_recorder_tap(tap.clone());

        // No telemetry yet
        let early = MediaBundle::new(1, 10.0).with_video("top", vec![1u8]);
        relay.handle_media(&early.encode().unwrap()).unwrap();

        relay.handle_command(&relay_message(10.0)).unwrap();
        let mut last = MediaBundle::new(2, 10.2).with_video("top", vec![2u8]);
        last.episode_end = Some(true);
        relay.handle_media(&last.encode().unwrap()).unwrap();

        let stats = relay.stats();
        assert_eq!(stats.paired, 1);
        assert_eq!(stats.unpaired, 1);
        assert_eq!(stats.episode_ends, 1);
        assert_eq!(tap.superseded(), 0);
    }
}
