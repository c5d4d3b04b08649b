//! Sensor hub
//!
//! Collects per-source Euler samples from the upstream sensor collaborator,
//! applies yaw normalization, feeds the liveness tracker and owns the gripper
//! command. Sources deliver both samples and gripper commands; the publish
//! loop reads frames from the hub through `FrameSource`.

use super::pose::{Pose, PoseSolver, SourceAngles};
use super::yaw::{YawMode, YawNormalizer};
use crate::config::LivenessConfig;
use crate::telemetry::{EulerAngles, FrameSource, LivenessTracker, SourceEuler, SourceLiveness, TelemetryFrame};
use crate::utils::{unix_now, Shutdown};
use async_trait::async_trait;
use parking_lot::Mutex as ParkingMutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::time::{Interval, MissedTickBehavior};

/// Samples with every axis within this many degrees of zero are not valid yet
pub const ZERO_EPSILON_DEG: f64 = 0.01;

/// Gripper change per open/close key
pub const GRIPPER_STEP: f64 = 0.01;

/// One reading from an upstream sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub source_id: String,
    /// Degrees
    pub angles: EulerAngles,
    /// Unix seconds
    pub timestamp: f64,
}

impl SensorSample {
    pub fn new(source_id: impl Into<String>, angles: EulerAngles, timestamp: f64) -> Self {
        Self {
            source_id: source_id.into(),
            angles,
            timestamp,
        }
    }

    /// Sensors report all zeros until they have a fix
    pub fn is_blank(&self) -> bool {
        self.angles.roll.abs() <= ZERO_EPSILON_DEG
            && self.angles.pitch.abs() <= ZERO_EPSILON_DEG
            && self.angles.yaw.abs() <= ZERO_EPSILON_DEG
    }
}

/// Operator gripper input, 0.0 closed to 1.0 open
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GripperCommand {
    Set(f64),
    Adjust(f64),
}

/// Anything an upstream source can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum SensorInput {
    Sample(SensorSample),
    Gripper(GripperCommand),
}

/// Hub counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub accepted: u64,
    /// Blank samples and samples from sources that are not configured
    pub ignored: u64,
    pub solve_failures: u64,
    pub gripper_commands: u64,
}

struct HubState {
    liveness: LivenessTracker,
    angles: SourceAngles,
    yaw: HashMap<String, YawNormalizer>,
    stats: HubStats,
}

pub struct SensorHub {
    state: ParkingMutex<HubState>,
    gripper: ParkingMutex<f64>,
    solver: Box<dyn PoseSolver>,
    yaw_mode: YawMode,
}

impl SensorHub {
    pub fn new(liveness: &LivenessConfig, yaw_mode: YawMode, solver: Box<dyn PoseSolver>) -> Self {
        Self {
            state: ParkingMutex::new(HubState {
                liveness: LivenessTracker::new(liveness.timeout_secs, liveness.sources.clone()),
                angles: SourceAngles::new(),
                yaw: HashMap::new(),
                stats: HubStats::default(),
            }),
            gripper: ParkingMutex::new(0.0),
            solver,
            yaw_mode,
        }
    }

    /// Take one sample. Returns false when it was ignored as blank or as
    /// coming from a source that is not configured.
    pub fn ingest(&self, sample: SensorSample) -> bool {
        let mut state = self.state.lock();
        if sample.is_blank() || !state.liveness.sources().contains(&sample.source_id) {
            state.stats.ignored += 1;
            return false;
        }

        let yaw_mode = self.yaw_mode;
        let yaw = state
            .yaw
            .entry(sample.source_id.clone())
            .or_insert_with(|| {
                tracing::info!(
                    "First valid sample from {}: roll {:.2}, pitch {:.2}, yaw {:.2}",
                    sample.source_id,
                    sample.angles.roll,
                    sample.angles.pitch,
                    sample.angles.yaw
                );
                YawNormalizer::new(yaw_mode)
            })
            .normalize(sample.angles.yaw);

        let angles = EulerAngles::new(sample.angles.roll, sample.angles.pitch, yaw);
        state.angles.insert(sample.source_id.clone(), angles);
        state.liveness.report(&sample.source_id, sample.timestamp);
        state.stats.accepted += 1;
        true
    }

    /// Route one source input
    pub fn apply(&self, input: SensorInput) -> bool {
        match input {
            SensorInput::Sample(sample) => self.ingest(sample),
            SensorInput::Gripper(command) => {
                let value = match command {
                    GripperCommand::Set(value) => {
                        self.set_gripper(value);
                        self.gripper()
                    }
                    GripperCommand::Adjust(delta) => self.adjust_gripper(delta),
                };
                self.state.lock().stats.gripper_commands += 1;
                tracing::debug!("Gripper at {:.3}", value);
                true
            }
        }
    }

    /// Set the gripper command, clamped to [0, 1]
    pub fn set_gripper(&self, value: f64) {
        if value.is_finite() {
            *self.gripper.lock() = value.clamp(0.0, 1.0);
        }
    }

    /// Move the gripper command by `delta`, clamped to [0, 1]
    pub fn adjust_gripper(&self, delta: f64) -> f64 {
        let mut gripper = self.gripper.lock();
        if delta.is_finite() {
            *gripper = (*gripper + delta).clamp(0.0, 1.0);
        }
        *gripper
    }

    pub fn gripper(&self) -> f64 {
        *self.gripper.lock()
    }

    pub fn liveness(&self, now: f64) -> Vec<SourceLiveness> {
        self.state.lock().liveness.snapshot(now)
    }

    pub fn offline_sources(&self, now: f64) -> Vec<String> {
        let state = self.state.lock();
        state
            .liveness
            .offline_sources(now)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Latest normalized angles of one source, in degrees
    pub fn angles(&self, source_id: &str) -> Option<EulerAngles> {
        self.state.lock().angles.get(source_id).copied()
    }

    /// Current solved pose, including the position before mapping
    pub fn pose(&self) -> Option<Pose> {
        let state = self.state.lock();
        self.solver.solve(&state.angles)
    }

    pub fn yaw_mode(&self) -> YawMode {
        self.yaw_mode
    }

    pub fn stats(&self) -> HubStats {
        self.state.lock().stats.clone()
    }
}

impl FrameSource for SensorHub {
    fn all_online(&self, now: f64) -> bool {
        self.state.lock().liveness.all_online(now)
    }

    fn frame(&self, now: f64) -> Option<TelemetryFrame> {
        let gripper = self.gripper();
        let mut state = self.state.lock();

        let pose = self.solver.solve(&state.angles)?;
        let sources: Vec<SourceEuler> = state
            .liveness
            .sources()
            .iter()
            .filter_map(|id| state.angles.get(id).map(|a| SourceEuler::new(id.clone(), *a)))
            .collect();

        match TelemetryFrame::new(pose.position, pose.orientation, gripper, sources, now) {
            Ok(frame) => Some(frame),
            Err(e) => {
                state.stats.solve_failures += 1;
                tracing::debug!("Discarded pose: {}", e);
                None
            }
        }
    }
}

/// Upstream sensor collaborator
#[async_trait]
pub trait SensorSource: Send {
    /// Source name for logs
    fn name(&self) -> &str;

    /// Next input; `None` when the source is exhausted
    async fn next_input(&mut self) -> Option<SensorInput>;
}

/// Pump a sensor source into the hub until shutdown or exhaustion
pub async fn run_sensor(mut source: Box<dyn SensorSource>, hub: Arc<SensorHub>, shutdown: Shutdown) {
    tracing::info!("Sensor source {} started", source.name());
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            input = source.next_input() => match input {
                Some(input) => {
                    hub.apply(input);
                }
                None => break,
            },
        }
    }
    tracing::info!("Sensor source {} stopped", source.name());
}

/// Line formats accepted on sensor input:
/// - `{"sourceId":"imu1","roll":1.0,"pitch":2.0,"yaw":3.0,"timestamp":1700000000.0}`
/// - `{"gripper":0.4}` or `{"gripperDelta":-0.05}`
/// - `1` opens the gripper one step, `2` closes it one step
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Sample(SampleLine),
    Gripper(GripperLine),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SampleLine {
    #[serde(alias = "source_id")]
    source_id: String,
    roll: f64,
    pitch: f64,
    yaw: f64,
    /// Receive time is used when absent
    #[serde(default)]
    timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GripperLine {
    #[serde(default)]
    gripper: Option<f64>,
    #[serde(default)]
    gripper_delta: Option<f64>,
}

impl GripperLine {
    fn command(&self) -> Option<GripperCommand> {
        match (self.gripper, self.gripper_delta) {
            (Some(value), _) => Some(GripperCommand::Set(value)),
            (None, Some(delta)) => Some(GripperCommand::Adjust(delta)),
            (None, None) => None,
        }
    }
}

fn parse_input_line(line: &str) -> Result<SensorInput, String> {
    match line {
        "1" => return Ok(SensorInput::Gripper(GripperCommand::Adjust(GRIPPER_STEP))),
        "2" => return Ok(SensorInput::Gripper(GripperCommand::Adjust(-GRIPPER_STEP))),
        _ => {}
    }

    match serde_json::from_str::<InputLine>(line).map_err(|e| e.to_string())? {
        InputLine::Sample(s) => {
            let timestamp = s.timestamp.unwrap_or_else(unix_now);
            Ok(SensorInput::Sample(SensorSample::new(
                s.source_id,
                EulerAngles::new(s.roll, s.pitch, s.yaw),
                timestamp,
            )))
        }
        InputLine::Gripper(g) => g
            .command()
            .map(SensorInput::Gripper)
            .ok_or_else(|| "empty gripper command".to_string()),
    }
}

/// Reads JSON-lines samples and gripper commands, e.g. piped from a serial
/// bus decoder and an operator console
pub struct JsonLinesSensor<R> {
    name: String,
    lines: Lines<R>,
    malformed: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSensor<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
            malformed: 0,
        }
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SensorSource for JsonLinesSensor<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_input(&mut self) -> Option<SensorInput> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!("Sensor input {} failed: {}", self.name, e);
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_input_line(line) {
                Ok(input) => return Some(input),
                Err(e) => {
                    self.malformed += 1;
                    if self.malformed.is_power_of_two() {
                        tracing::warn!("Malformed sensor line on {} ({} total): {}", self.name, self.malformed, e);
                    }
                }
            }
        }
    }
}

/// Smooth synthetic motion for every configured source
pub struct SimulatedSensor {
    sources: Vec<String>,
    ticker: Interval,
    started: Instant,
    next_source: usize,
}

impl SimulatedSensor {
    /// One sample per source every `interval`
    pub fn new(sources: Vec<String>, interval: Duration) -> Self {
        let per_sample = interval / sources.len().max(1) as u32;
        let mut ticker = tokio::time::interval(per_sample.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            sources,
            ticker,
            started: Instant::now(),
            next_source: 0,
        }
    }

    /// Angles of source `index` at `t` seconds
    fn angles_at(index: usize, t: f64) -> EulerAngles {
        let phase = index as f64 * 0.7;
        EulerAngles::new(
            5.0 * (0.4 * t + phase).sin() + 1.0,
            15.0 * (0.3 * t + phase).sin(),
            25.0 * (0.2 * t + phase).sin(),
        )
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn next_input(&mut self) -> Option<SensorInput> {
        if self.sources.is_empty() {
            return None;
        }
        self.ticker.tick().await;

        let index = self.next_source % self.sources.len();
        self.next_source = self.next_source.wrapping_add(1);

        let t = self.started.elapsed().as_secs_f64();
        let mut angles = Self::angles_at(index, t);
        let mut rng = rand::thread_rng();
        angles.roll += rng.gen_range(-0.05..0.05);
        angles.pitch += rng.gen_range(-0.05..0.05);

        Some(SensorInput::Sample(SensorSample::new(
            self.sources[index].clone(),
            angles,
            unix_now(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArmConfig;
    use crate::producer::pose::TwoLinkArm;

    fn hub() -> SensorHub {
        SensorHub::new(
            &LivenessConfig::default(),
            YawMode::Normal,
            Box::new(TwoLinkArm::new(ArmConfig::default())),
        )
    }

    #[test]
    fn test_blank_samples_are_ignored() {
        let hub = hub();
        assert!(!hub.ingest(SensorSample::new("imu1", EulerAngles::new(0.0, 0.005, -0.01), 1.0)));
        assert!(hub.angles("imu1").is_none());
        assert!(!hub.all_online(1.0));
        assert_eq!(hub.stats().ignored, 1);
    }

    #[test]
    fn test_yaw_is_zeroed_per_source() {
        let hub = hub();
        hub.ingest(SensorSample::new("imu1", EulerAngles::new(1.0, 2.0, 90.0), 1.0));
        hub.ingest(SensorSample::new("imu2", EulerAngles::new(1.0, 2.0, -30.0), 1.0));
        hub.ingest(SensorSample::new("imu1", EulerAngles::new(1.0, 2.0, 100.0), 1.1));

        assert_eq!(hub.angles("imu1").unwrap().yaw, 10.0);
        assert_eq!(hub.angles("imu2").unwrap().yaw, 0.0);
    }

    #[test]
    fn test_frame_needs_every_source() {
        let hub = hub();
        hub.set_gripper(0.5);
        for id in ["imu1", "imu2"] {
            hub.ingest(SensorSample::new(id, EulerAngles::new(1.0, 0.0, 0.0), 10.0));
        }
        assert!(hub.frame(10.1).is_none());
        assert!(!hub.all_online(10.1));
        assert_eq!(hub.offline_sources(10.1), vec!["imu3".to_string()]);

        hub.ingest(SensorSample::new("imu3", EulerAngles::new(90.0, 0.0, 5.0), 10.0));
        assert!(hub.all_online(10.1));

        let frame = hub.frame(10.1).unwrap();
        assert_eq!(frame.gripper(), 0.5);
        assert_eq!(frame.capture_time(), 10.1);
        assert_eq!(frame.sources().len(), 3);
        assert!((frame.orientation()[0] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        // Both links flat and yaw zeroed: fully extended
        assert!((frame.position()[0] - 0.42).abs() < 1e-9);

        assert!(!hub.all_online(11.5));
    }

    #[test]
    fn test_unconfigured_source_is_ignored() {
        let hub = hub();
        assert!(!hub.ingest(SensorSample::new("imu9", EulerAngles::new(1.0, 2.0, 3.0), 1.0)));
        assert!(hub.angles("imu9").is_none());
        assert_eq!(hub.stats().ignored, 1);
        assert_eq!(hub.stats().accepted, 0);
    }

    #[test]
    fn test_gripper_is_clamped() {
        let hub = hub();
        hub.set_gripper(1.7);
        assert_eq!(hub.gripper(), 1.0);
        assert_eq!(hub.adjust_gripper(-0.25), 0.75);
        assert_eq!(hub.adjust_gripper(-5.0), 0.0);
        hub.set_gripper(f64::NAN);
        assert_eq!(hub.gripper(), 0.0);
    }

    #[tokio::test]
    async fn test_json_lines_skip_malformed() {
        let input: &[u8] = b"{\"sourceId\":\"imu1\",\"roll\":1.0,\"pitch\":2.0,\"yaw\":3.0,\"timestamp\":5.0}\n\nnot json\n{\"source_id\":\"imu2\",\"roll\":4.0,\"pitch\":5.0,\"yaw\":6.0}\n";
        let mut sensor = JsonLinesSensor::new("stdin", input);

        let first = sensor.next_input().await.unwrap();
        assert_eq!(
            first,
            SensorInput::Sample(SensorSample::new("imu1", EulerAngles::new(1.0, 2.0, 3.0), 5.0))
        );

        let second = match sensor.next_input().await.unwrap() {
            SensorInput::Sample(sample) => sample,
            other => panic!("expected a sample, got {:?}", other),
        };
        assert_eq!(second.source_id, "imu2");
        assert!(second.timestamp > 0.0);
        assert_eq!(sensor.malformed(), 1);

        assert!(sensor.next_input().await.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_gripper_commands() {
        let input: &[u8] = b"{\"gripper\":0.4}\n1\n 2 \n2\n{\"gripperDelta\":0.25}\n{}\n{\"gripper\":1,\"extra\":true}\n";
        let mut sensor = JsonLinesSensor::new("console", input);

        let mut commands = Vec::new();
        while let Some(input) = sensor.next_input().await {
            match input {
                SensorInput::Gripper(command) => commands.push(command),
                other => panic!("expected a gripper command, got {:?}", other),
            }
        }

        assert_eq!(
            commands,
            vec![
                GripperCommand::Set(0.4),
                GripperCommand::Adjust(GRIPPER_STEP),
                GripperCommand::Adjust(-GRIPPER_STEP),
                GripperCommand::Adjust(-GRIPPER_STEP),
                GripperCommand::Adjust(0.25),
            ]
        );
        assert_eq!(sensor.malformed(), 2);
    }

    #[tokio::test]
    async fn test_gripper_input_reaches_frame() {
        let hub = Arc::new(hub());
        let input: &[u8] = b"{\"sourceId\":\"imu1\",\"roll\":1.0,\"pitch\":0.0,\"yaw\":0.0,\"timestamp\":10.0}\n\
{\"sourceId\":\"imu2\",\"roll\":1.0,\"pitch\":0.0,\"yaw\":0.0,\"timestamp\":10.0}\n\
{\"sourceId\":\"imu3\",\"roll\":1.0,\"pitch\":0.0,\"yaw\":0.0,\"timestamp\":10.0}\n\
{\"gripper\":0.5}\n1\n1\n2\n1\n";
        let sensor = JsonLinesSensor::new("stdin", input);

        run_sensor(Box::new(sensor), hub.clone(), Shutdown::new()).await;

        let frame = hub.frame(10.1).unwrap();
        assert!((frame.gripper() - 0.52).abs() < 1e-9);
        assert_eq!(hub.stats().gripper_commands, 5);
        assert_eq!(hub.stats().accepted, 3);
    }

    #[tokio::test]
    async fn test_simulator_feeds_hub() {
        let sources = vec!["imu1".to_string(), "imu2".to_string(), "imu3".to_string()];
        let hub = Arc::new(hub());
        let shutdown = Shutdown::new();
        let sensor = SimulatedSensor::new(sources, Duration::from_millis(3));

        let task = tokio::spawn(run_sensor(Box::new(sensor), hub.clone(), shutdown.clone()));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !hub.all_online(unix_now()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();
        task.await.unwrap();

        assert!(hub.all_online(unix_now()));
        assert!(hub.frame(unix_now()).is_some());
    }
}
