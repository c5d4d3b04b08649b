//! Producer diagnostics
//!
//! Latest pose, a bounded trajectory ring, the publish rate and media receive
//! counters. Written by the publish loop and media receiver, read by status
//! logging. Each accessor holds its lock only for the copy.

use super::frame::TelemetryFrame;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trajectory ring size
pub const TRAJECTORY_CAPACITY: usize = 1000;

/// Last published pose
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseSnapshot {
    pub position: [f64; 3],
    pub orientation: [f64; 3],
    pub gripper: f64,
    pub capture_time: f64,
}

/// Media receive counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReceiveStats {
    pub bundles_received: u64,
    pub video_frames: u64,
    pub audio_segments: u64,
    pub decode_errors: u64,
    /// Receive time minus capture time of the last bundle
    pub last_latency_secs: Option<f64>,
}

#[derive(Debug)]
struct RateWindow {
    count_at_sample: u64,
    sampled_at: Option<f64>,
}

#[derive(Debug)]
pub struct Diagnostics {
    latest: ParkingMutex<Option<PoseSnapshot>>,
    trajectory: ParkingMutex<VecDeque<[f64; 3]>>,
    trajectory_capacity: usize,
    published: AtomicU64,
    rate: ParkingMutex<RateWindow>,
    media: ParkingMutex<MediaReceiveStats>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::with_trajectory_capacity(TRAJECTORY_CAPACITY)
    }

    pub fn with_trajectory_capacity(capacity: usize) -> Self {
        Self {
            latest: ParkingMutex::new(None),
            trajectory: ParkingMutex::new(VecDeque::with_capacity(capacity)),
            trajectory_capacity: capacity.max(1),
            published: AtomicU64::new(0),
            rate: ParkingMutex::new(RateWindow {
                count_at_sample: 0,
                sampled_at: None,
            }),
            media: ParkingMutex::new(MediaReceiveStats::default()),
        }
    }

    /// Record a published frame
    pub fn record_publish(&self, frame: &TelemetryFrame) {
        *self.latest.lock() = Some(PoseSnapshot {
            position: frame.position(),
            orientation: frame.orientation(),
            gripper: frame.gripper(),
            capture_time: frame.capture_time(),
        });

        {
            let mut trajectory = self.trajectory.lock();
            if trajectory.len() >= self.trajectory_capacity {
                trajectory.pop_front();
            }
            trajectory.push_back(frame.position());
        }

        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latest_pose(&self) -> Option<PoseSnapshot> {
        self.latest.lock().clone()
    }

    /// Recorded positions, oldest first
    pub fn trajectory(&self) -> Vec<[f64; 3]> {
        self.trajectory.lock().iter().copied().collect()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publishes per second since the previous sample. The first call only
    /// starts the window and returns `None`.
    pub fn sample_publish_rate(&self, now: f64) -> Option<f64> {
        let count = self.published();
        let mut window = self.rate.lock();
        let rate = window.sampled_at.and_then(|since| {
            let elapsed = now - since;
            (elapsed > 0.0).then(|| (count - window.count_at_sample) as f64 / elapsed)
        });
        window.count_at_sample = count;
        window.sampled_at = Some(now);
        rate
    }

    /// Record one received media bundle
    pub fn record_media(&self, capture_time: f64, now: f64, video_frames: u64, audio_segments: u64) {
        let mut media = self.media.lock();
        media.bundles_received += 1;
        media.video_frames += video_frames;
        media.audio_segments += audio_segments;
        media.last_latency_secs = Some(now - capture_time);
    }

    pub fn record_decode_error(&self) {
        self.media.lock().decode_errors += 1;
    }

    pub fn media_stats(&self) -> MediaReceiveStats {
        self.media.lock().clone()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
