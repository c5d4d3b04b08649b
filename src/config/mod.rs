//! Process configuration
//!
//! Serde structs for both nodes. Values come from defaults, an optional JSON
//! file, and finally command-line flags applied by the binaries.

use crate::producer::yaw::YawMode;
use crate::transport::{Endpoint, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These are the only fatal errors at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Load a configuration file, falling back to defaults for missing fields
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: T = serde_json::from_str(&content)?;
    tracing::debug!("Loaded configuration from {:?}", path);
    Ok(config)
}

// =============================================================================
// Channel Types
// =============================================================================

/// Settings shared by every queued/broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Sender/receiver side queue bound (messages)
    pub queue_capacity: usize,

    /// Upper bound for a single frame write
    pub send_timeout_ms: u64,

    /// Upper bound for a single connect attempt
    pub connect_timeout_ms: u64,

    /// Largest accepted frame payload
    pub max_frame_bytes: usize,

    /// Reconnect policy
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            send_timeout_ms: 1000,
            connect_timeout_ms: 1000,
            max_frame_bytes: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChannelConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queueCapacity", "must be at least 1"));
        }
        if self.send_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeouts", "must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("maxFrameBytes", "must be positive"));
        }
        self.retry.validate()
    }
}

// =============================================================================
// Producer Types
// =============================================================================

/// Liveness gating for the publish loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LivenessConfig {
    /// A source is online while `now - last_seen < timeout_secs`
    pub timeout_secs: f64,

    /// Sources that must all be online
    pub sources: Vec<String>,

    /// Skip publish ticks while any source is offline
    pub strict_gating: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1.0,
            sources: vec!["imu1".to_string(), "imu2".to_string(), "imu3".to_string()],
            strict_gating: true,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(ConfigError::invalid("timeoutSecs", "must be positive"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one source is required"));
        }
        Ok(())
    }
}

/// Jitter buffer and audio frame geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JitterConfig {
    /// Maximum queued segments; the oldest is dropped beyond this
    pub capacity: usize,

    /// Segments to accumulate before playback starts
    pub min_fill: usize,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u16,

    /// Samples per channel in one segment
    pub frame_samples: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            min_fill: 2,
            sample_rate: 48000,
            channels: 1,
            // 60ms @ 48kHz
            frame_samples: 2880,
        }
    }
}

impl JitterConfig {
    /// Nominal playback duration of one segment
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(self.frame_samples as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64)
    }

    /// Interleaved sample count of one segment
    pub fn segment_len(&self) -> usize {
        self.frame_samples * self.channels as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }
        if self.min_fill == 0 || self.min_fill > self.capacity {
            return Err(ConfigError::invalid(
                "minFill",
                format!("must be between 1 and capacity ({})", self.capacity),
            ));
        }
        if self.sample_rate == 0 || self.channels == 0 || self.frame_samples == 0 {
            return Err(ConfigError::invalid("audio format", "must be non-zero"));
        }
        Ok(())
    }
}

/// Two-link arm geometry and workspace mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArmConfig {
    /// Link lengths in meters
    pub link1: f64,
    pub link2: f64,

    /// Source driving each link, and the tool (wrist) source
    pub link1_source: String,
    pub link2_source: String,
    pub tool_source: String,

    /// Raw workspace bounds (meters); positions are clipped to these
    pub raw_min: [f64; 3],
    pub raw_max: [f64; 3],

    /// Target workspace the raw range is mapped onto
    pub target_min: [f64; 3],
    pub target_max: [f64; 3],
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            link1: 0.25,
            link2: 0.27,
            link1_source: "imu1".to_string(),
            link2_source: "imu2".to_string(),
            tool_source: "imu3".to_string(),
            raw_min: [0.39, -0.4, 0.0],
            raw_max: [0.52, 0.4, 0.3],
            target_min: [0.22, -0.2, 0.1],
            target_max: [0.42, 0.2, 0.4],
        }
    }
}

impl ArmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link1 <= 0.0 || self.link2 <= 0.0 {
            return Err(ConfigError::invalid("link lengths", "must be positive"));
        }
        for axis in 0..3 {
            if self.raw_max[axis] <= self.raw_min[axis] {
                return Err(ConfigError::invalid("rawMax", "must exceed rawMin on every axis"));
            }
        }
        Ok(())
    }
}

/// Telemetry-producing node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProducerConfig {
    /// Relay leg (binary telemetry)
    pub relay: Endpoint,

    /// Simulation leg (text telemetry); `None` disables it
    pub simulation: Option<Endpoint>,

    /// Relay broadcast address for returned media; `None` disables it
    pub media: Option<String>,

    pub video_enabled: bool,
    pub audio_enabled: bool,

    /// Publish tick interval
    pub publish_interval_ms: u64,

    pub liveness: LivenessConfig,
    pub jitter: JitterConfig,
    pub arm: ArmConfig,
    pub yaw_mode: YawMode,

    /// Feed the sensor hub from the built-in simulator
    pub simulate_sensors: bool,

    pub channel: ChannelConfig,

    /// Interval between status log lines
    pub status_interval_secs: f64,

    /// Bind address for JSON status snapshots; `None` disables them
    pub diagnostics: Option<String>,

    /// Status snapshot cadence
    pub diagnostics_interval_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            relay: Endpoint::connect("localhost:5555"),
            simulation: Some(Endpoint::connect("localhost:5559")),
            media: Some("localhost:5557".to_string()),
            video_enabled: true,
            audio_enabled: true,
            // 20Hz
            publish_interval_ms: 50,
            liveness: LivenessConfig::default(),
            jitter: JitterConfig::default(),
            arm: ArmConfig::default(),
            yaw_mode: YawMode::Normal,
            simulate_sensors: false,
            channel: ChannelConfig::default(),
            status_interval_secs: 5.0,
            diagnostics: Some("0.0.0.0:5560".to_string()),
            // 20Hz
            diagnostics_interval_ms: 50,
        }
    }
}

impl ProducerConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_interval_ms == 0 {
            return Err(ConfigError::invalid("publishIntervalMs", "must be positive"));
        }
        if !(self.status_interval_secs > 0.0) {
            return Err(ConfigError::invalid("statusIntervalSecs", "must be positive"));
        }
        if self.diagnostics_interval_ms == 0 {
            return Err(ConfigError::invalid("diagnosticsIntervalMs", "must be positive"));
        }
        self.liveness.validate()?;
        self.jitter.validate()?;
        self.arm.validate()?;

        // The solver reads these sources; the hub only stores tracked ones
        for source in [&self.arm.link1_source, &self.arm.link2_source, &self.arm.tool_source] {
            if !self.liveness.sources.contains(source) {
                return Err(ConfigError::invalid(
                    "arm",
                    format!("source {} is not in liveness.sources", source),
                ));
            }
        }
        self.channel.validate()
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_millis(self.diagnostics_interval_ms)
    }
}

// =============================================================================
// Relay Types
// =============================================================================

/// Episode recording at the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecorderConfig {
    pub enabled: bool,

    /// Directory that holds datasets
    pub data_root: PathBuf,

    /// Dataset name; the dataset lives in `data_root/repo_id`
    pub repo_id: String,

    /// Task description stored with the dataset
    pub instruction: String,

    /// Recording cadence in frames per second
    pub fps: u32,

    /// Largest accepted gap between paired telemetry and media
    pub max_pair_skew_secs: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_root: PathBuf::from("real_robot_data"),
            repo_id: "real_robot_online_data".to_string(),
            instruction: "Real robot teleoperation data collection".to_string(),
            fps: 30,
            max_pair_skew_secs: 0.5,
        }
    }
}

impl RecorderConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_root.join(&self.repo_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 {
            return Err(ConfigError::invalid("fps", "must be positive"));
        }
        if self.repo_id.trim().is_empty() {
            return Err(ConfigError::invalid("repoId", "must not be empty"));
        }
        if !(self.max_pair_skew_secs >= 0.0) {
            return Err(ConfigError::invalid("maxPairSkewSecs", "must not be negative"));
        }
        Ok(())
    }
}

/// Relay/recording node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    /// Telemetry from the producer
    pub command_in: Endpoint,

    /// Re-encoded commands to the execution node
    pub command_out: Endpoint,

    /// Media bundles from the execution node
    pub media_in: Endpoint,

    /// Broadcast bind address for media back to the producer
    pub media_out: String,

    /// Per-subscriber broadcast backlog
    pub broadcast_capacity: usize,

    pub channel: ChannelConfig,
    pub recorder: RecorderConfig,

    /// Interval between status log lines
    pub status_interval_secs: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command_in: Endpoint::bind("0.0.0.0:5555"),
            command_out: Endpoint::bind("0.0.0.0:5556"),
            media_in: Endpoint::bind("0.0.0.0:5558"),
            media_out: "0.0.0.0:5557".to_string(),
            broadcast_capacity: 8,
            channel: ChannelConfig::default(),
            recorder: RecorderConfig::default(),
            status_interval_secs: 5.0,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::invalid("broadcastCapacity", "must be at least 1"));
        }
        if !(self.status_interval_secs > 0.0) {
            return Err(ConfigError::invalid("statusIntervalSecs", "must be positive"));
        }
        self.channel.validate()?;
        if self.recorder.enabled {
            self.recorder.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EndpointMode;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        ProducerConfig::default().validate().unwrap();
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_arm_sources_must_be_tracked() {
        let mut config = ProducerConfig::default();
        config.arm.tool_source = "imu4".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "arm", .. })));

        config.liveness.sources.push("imu4".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_jitter_min_fill_cannot_exceed_capacity() {
        let config = JitterConfig {
            capacity: 3,
            min_fill: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "minFill", .. })
        ));
    }

    #[test]
    fn test_frame_duration_is_sixty_ms() {
        let config = JitterConfig::default();
        assert_eq!(config.frame_duration(), Duration::from_millis(60));
        assert_eq!(config.segment_len(), 2880);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("producer.json");
        fs::write(
            &path,
            r#"{ "publishIntervalMs": 100, "relay": "connect://10.0.0.2:5555",
                 "liveness": { "timeoutSecs": 2.5 } }"#,
        )
        .unwrap();

        let config: ProducerConfig = load_config(&path).unwrap();
        assert_eq!(config.publish_interval_ms, 100);
        assert_eq!(config.relay.mode, EndpointMode::Connect);
        assert_eq!(config.relay.address, "10.0.0.2:5555");
        assert_eq!(config.liveness.timeout_secs, 2.5);
        assert_eq!(config.liveness.sources.len(), 3);
        assert_eq!(config.jitter.capacity, 5);
    }

    #[test]
    fn test_load_rejects_bad_endpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(&path, r#"{ "commandIn": "udp://nowhere" }"#).unwrap();
        assert!(matches!(
            load_config::<RelayConfig>(&path),
            Err(ConfigError::Json(_))
        ));
    }
}
