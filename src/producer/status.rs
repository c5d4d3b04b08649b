//! Operator status snapshots
//!
//! A JSON view of the producer for dashboards: per-source angles and
//! liveness, raw and mapped position, gripper, counters and the arm setup.
//! Snapshots go out on their own channel at a fixed cadence and nothing on
//! the publish path waits on them.

use super::sensor::{HubStats, SensorHub};
use super::yaw::YawMode;
use crate::audio::{JitterBuffer, JitterStats};
use crate::config::ArmConfig;
use crate::telemetry::{Diagnostics, DualPublisher, EulerAngles, MediaReceiveStats, PublishStats};
use crate::transport::{MessageSink, TransportError};
use crate::utils::{unix_now, Shutdown};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// One source as seen by the hub
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub source_id: String,
    /// Normalized degrees; `None` until the first valid sample
    pub angles: Option<EulerAngles>,
    pub last_seen: Option<f64>,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionStatus {
    /// Solved position before clipping and mapping
    pub raw: [f64; 3],
    pub mapped: [f64; 3],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStatus {
    pub count: u64,
    /// Publishes per second since the previous snapshot
    pub rate_hz: Option<f64>,
    #[serde(flatten)]
    pub stats: PublishStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmStatus {
    pub link1: f64,
    pub link2: f64,
    pub yaw_mode: YawMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub timestamp: f64,
    pub sources: Vec<SourceStatus>,
    pub position: Option<PositionStatus>,
    pub gripper: f64,
    pub publish: PublishStatus,
    pub hub: HubStats,
    pub media: MediaReceiveStats,
    pub jitter: Option<JitterStats>,
    pub config: ArmStatus,
}

/// Snapshot send counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusStats {
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct RateWindow {
    count: u64,
    at: Option<f64>,
}

pub struct StatusPublisher {
    hub: Arc<SensorHub>,
    publisher: Arc<DualPublisher>,
    diagnostics: Arc<Diagnostics>,
    jitter: Option<Arc<JitterBuffer>>,
    arm: ArmStatus,
    sink: Arc<dyn MessageSink>,
    rate: ParkingMutex<RateWindow>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl StatusPublisher {
    pub fn new(
        hub: Arc<SensorHub>,
        publisher: Arc<DualPublisher>,
        arm: &ArmConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let diagnostics = publisher.diagnostics().clone();
        let arm = ArmStatus {
            link1: arm.link1,
            link2: arm.link2,
            yaw_mode: hub.yaw_mode(),
        };
        Self {
            hub,
            publisher,
            diagnostics,
            jitter: None,
            arm,
            sink,
            rate: ParkingMutex::new(RateWindow::default()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_jitter(mut self, jitter: Option<Arc<JitterBuffer>>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn snapshot(&self, now: f64) -> StatusSnapshot {
        let sources = self
            .hub
            .liveness(now)
            .into_iter()
            .map(|l| SourceStatus {
                angles: self.hub.angles(&l.source_id),
                source_id: l.source_id,
                last_seen: l.last_seen,
                online: l.online,
            })
            .collect();

        let position = self.hub.pose().map(|pose| PositionStatus {
            raw: pose.raw_position,
            mapped: pose.position,
        });

        let count = self.diagnostics.published();
        let rate_hz = {
            let mut window = self.rate.lock();
            let rate = window.at.and_then(|since| {
                let elapsed = now - since;
                (elapsed > 0.0).then(|| count.saturating_sub(window.count) as f64 / elapsed)
            });
            window.count = count;
            window.at = Some(now);
            rate
        };

        StatusSnapshot {
            timestamp: now,
            sources,
            position,
            gripper: self.hub.gripper(),
            publish: PublishStatus {
                count,
                rate_hz,
                stats: self.publisher.stats(),
            },
            hub: self.hub.stats(),
            media: self.diagnostics.media_stats(),
            jitter: self.jitter.as_ref().map(|j| j.stats()),
            config: self.arm.clone(),
        }
    }

    /// Encode and hand one snapshot to the sink
    pub fn send(&self, now: f64) -> bool {
        let payload = match serde_json::to_vec(&self.snapshot(now)) {
            Ok(payload) => payload,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to encode status snapshot: {}", e);
                return false;
            }
        };

        match self.sink.try_send(Bytes::from(payload)) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TransportError::Closed(name)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Status channel {} is closed", name);
                false
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Status send on {} failed: {}", self.sink.name(), e);
                false
            }
        }
    }

    pub fn stats(&self) -> StatusStats {
        StatusStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Status snapshots on {} every {:?}", self.sink.name(), interval);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    self.send(unix_now());
                }
            }
        }

        tracing::debug!("Status snapshots stopped after {} sent", self.stats().sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, LivenessConfig};
    use crate::producer::pose::TwoLinkArm;
    use crate::producer::sensor::SensorSample;
    use crate::telemetry::FrameSource;
    use crate::transport::{BroadcastPublisher, BroadcastSubscriber, MemorySink};

    fn setup(sink: Arc<dyn MessageSink>) -> (Arc<SensorHub>, Arc<DualPublisher>, StatusPublisher) {
        let arm = ArmConfig::default();
        let hub = Arc::new(SensorHub::new(
            &LivenessConfig::default(),
            YawMode::Normal,
            Box::new(TwoLinkArm::new(arm.clone())),
        ));
        let relay = Arc::new(MemorySink::new("relay"));
        let publisher = Arc::new(DualPublisher::new(relay, None, true, Arc::new(Diagnostics::new())));
        let status = StatusPublisher::new(hub.clone(), publisher.clone(), &arm, sink);
        (hub, publisher, status)
    }

    fn feed(hub: &SensorHub, t: f64) {
        for id in ["imu1", "imu2", "imu3"] {
            hub.ingest(SensorSample::new(id, EulerAngles::new(1.0, 0.0, 0.0), t));
        }
    }

    #[test]
    fn test_snapshot_reports_sources_and_position() {
        let sink = Arc::new(MemorySink::new("status"));
        let (hub, publisher, status) = setup(sink.clone());

        let empty = status.snapshot(10.0);
        assert!(empty.position.is_none());
        assert!(empty.sources.iter().all(|s| !s.online && s.angles.is_none()));
        assert_eq!(empty.publish.rate_hz, None);

        feed(&hub, 10.0);
        hub.set_gripper(0.3);
        for _ in 0..4 {
            publisher.tick(hub.as_ref(), 10.1);
        }

        let snapshot = status.snapshot(10.5);
        assert_eq!(snapshot.sources.len(), 3);
        assert!(snapshot.sources.iter().all(|s| s.online && s.angles.is_some()));
        let position = snapshot.position.unwrap();
        // Both links flat: fully extended, then clipped and mapped
        assert!((position.raw[0] - 0.52).abs() < 1e-9);
        assert!((position.mapped[0] - 0.42).abs() < 1e-9);
        assert_eq!(snapshot.gripper, 0.3);
        assert_eq!(snapshot.publish.count, 4);
        assert_eq!(snapshot.publish.rate_hz, Some(8.0));
        assert_eq!(snapshot.hub.accepted, 3);
        assert_eq!(snapshot.config.link1, 0.25);
        assert!(snapshot.jitter.is_none());
        assert!(hub.frame(10.5).is_some());
    }

    #[test]
    fn test_send_encodes_camel_case_json() {
        let sink = Arc::new(MemorySink::new("status"));
        let (hub, _publisher, status) = setup(sink.clone());
        feed(&hub, 20.0);

        assert!(status.send(20.0));
        let sent = sink.drain();
        assert_eq!(sent.len(), 1);

        let value: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(value["sources"][0]["sourceId"], "imu1");
        assert_eq!(value["config"]["yawMode"], "normal");
        assert!(value["position"]["raw"].is_array());
        assert_eq!(value["publish"]["count"], 0);
        assert_eq!(value["publish"]["relayFailures"], 0);
        assert_eq!(status.stats().sent, 1);
    }

    #[test]
    fn test_closed_sink_is_counted() {
        let sink = Arc::new(MemorySink::new("status"));
        let (_hub, _publisher, status) = setup(sink.clone());
        sink.close();

        assert!(!status.send(1.0));
        assert_eq!(status.stats().failed, 1);
        assert_eq!(status.stats().sent, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_snapshots() {
        let shutdown = Shutdown::new();
        let broadcast = Arc::new(
            BroadcastPublisher::spawn("status", "127.0.0.1:0", 8, ChannelConfig::default(), shutdown.clone())
                .await
                .unwrap(),
        );
        let mut subscriber = BroadcastSubscriber::spawn(
            "dashboard",
            broadcast.local_addr().to_string(),
            ChannelConfig::default(),
            shutdown.clone(),
        );

        let (hub, _publisher, status) = setup(broadcast.clone());
        hub.set_gripper(0.75);
        let status = Arc::new(status);
        let task = tokio::spawn(status.clone().run(Duration::from_millis(10), shutdown.clone()));

        let payload = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["gripper"], 0.75);
        assert_eq!(value["sources"].as_array().unwrap().len(), 3);

        shutdown.trigger();
        task.await.unwrap();
        assert!(status.stats().sent >= 1);
    }
}
