//! Recorder state
//!
//! Recorder state machine, the records it writes and the paired sample it
//! consumes.

use crate::media::MediaBundle;
use crate::telemetry::RelayTelemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Dataset format written by the directory store
pub const DATASET_FORMAT: &str = "teleop-episodes";

/// Dataset format version
pub const DATASET_VERSION: u32 = 1;

/// Current state of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// Not started
    Idle,
    /// Waiting for the first sample of an episode
    Waiting,
    /// Writing an episode
    Recording,
    /// Stopped for good
    Complete,
}

impl Default for RecorderState {
    fn default() -> Self {
        Self::Idle
    }
}

/// One telemetry message paired with the media bundle it belongs to
#[derive(Debug, Clone)]
pub struct RecordSample {
    pub telemetry: RelayTelemetry,
    pub bundle: MediaBundle,
}

impl RecordSample {
    /// Robot state: the bundle's reported state when present, else the
    /// per-source Euler angles (degrees) followed by the gripper
    pub fn state_vector(&self) -> Vec<f64> {
        if let Some(state) = self.bundle.state.as_ref().filter(|s| !s.is_empty()) {
            return state.clone();
        }
        let mut state: Vec<f64> = self
            .telemetry
            .sources
            .iter()
            .flat_map(|s| [s.roll, s.pitch, s.yaw])
            .collect();
        state.push(self.telemetry.gripper);
        state
    }

    /// Commanded action: position, orientation (radians), gripper
    pub fn action_vector(&self) -> Vec<f64> {
        let t = &self.telemetry;
        let mut action = Vec::with_capacity(7);
        action.extend_from_slice(&t.position);
        action.extend_from_slice(&t.orientation);
        action.push(t.gripper);
        action
    }

    /// Gap between telemetry and media capture
    pub fn skew(&self) -> f64 {
        (self.bundle.capture_time - self.telemetry.capture_time).abs()
    }
}

/// One appended line of an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_index: usize,
    pub timestep_index: usize,
    /// Media capture time, unix seconds
    pub timestamp: f64,
    pub state: Vec<f64>,
    pub action: Vec<f64>,
    /// Logical channel to image path relative to the dataset root
    pub images: BTreeMap<String, String>,
}

/// Summary of a finished episode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeSummary {
    pub episode_index: usize,

    /// Records written
    pub frames: usize,

    /// Wall-clock span of the episode in milliseconds
    pub duration_ms: f64,

    /// Unix timestamp when the episode started
    pub unix_start_ms: u64,

    /// Unix timestamp when the episode ended
    pub unix_end_ms: u64,
}

impl EpisodeSummary {
    /// Start an episode now
    pub fn new(episode_index: usize) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        Self {
            episode_index,
            frames: 0,
            duration_ms: 0.0,
            unix_start_ms: now,
            unix_end_ms: now,
        }
    }

    /// Close the episode
    pub fn end(&mut self) {
        self.unix_end_ms = Utc::now().timestamp_millis() as u64;
        self.duration_ms = self.unix_end_ms.saturating_sub(self.unix_start_ms) as f64;
    }
}

/// Dataset-level metadata, rewritten after every finished episode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMeta {
    /// Unique per recording run
    pub id: Uuid,
    pub format: String,
    pub version: u32,
    pub repo_id: String,
    pub fps: u32,
    pub instruction: String,
    pub state_dim: Option<usize>,
    pub action_dim: Option<usize>,
    pub channels: Vec<String>,
    pub episodes: Vec<EpisodeSummary>,
    pub created_at: DateTime<Utc>,
}

impl DatasetMeta {
    pub fn new(repo_id: &str, fps: u32, instruction: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            format: DATASET_FORMAT.to_string(),
            version: DATASET_VERSION,
            repo_id: repo_id.to_string(),
            fps,
            instruction: instruction.to_string(),
            state_dim: None,
            action_dim: None,
            channels: Vec::new(),
            episodes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.episodes.iter().map(|e| e.frames).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EulerAngles, SourceEuler, TelemetryFrame};

    fn sample(state: Option<Vec<f64>>) -> RecordSample {
        let frame = TelemetryFrame::new(
            [0.3, 0.0, 0.25],
            [0.1, -0.2, 0.0],
            0.5,
            vec![
                SourceEuler::new("imu1", EulerAngles::new(1.0, 2.0, 3.0)),
                SourceEuler::new("imu2", EulerAngles::new(4.0, 5.0, 6.0)),
            ],
            10.0,
        )
        .unwrap();
        let mut bundle = MediaBundle::new(1, 10.1).with_video("top", vec![1u8]);
        bundle.state = state;
        RecordSample {
            telemetry: RelayTelemetry::from_frame(&frame),
            bundle,
        }
    }

    #[test]
    fn test_state_vector_from_sources() {
        let s = sample(None);
        assert_eq!(s.state_vector(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.5]);
        assert_eq!(s.action_vector(), vec![0.3, 0.0, 0.25, 0.1, -0.2, 0.0, 0.5]);
        assert!((s.skew() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reported_state_wins() {
        assert_eq!(sample(Some(vec![9.0, 8.0])).state_vector(), vec![9.0, 8.0]);
        assert_eq!(sample(Some(vec![])).state_vector().len(), 7);
    }
}
