//! Producer node
//!
//! Sensor ingestion, yaw normalization, pose solving and the media receive
//! path of the telemetry-producing node, plus its JSON status snapshots.

pub mod media_receiver;
pub mod pose;
pub mod sensor;
pub mod status;
pub mod yaw;

pub use media_receiver::MediaReceiver;
pub use pose::{Pose, PoseSolver, SourceAngles, TwoLinkArm};
pub use sensor::{
    run_sensor, GripperCommand, HubStats, JsonLinesSensor, SensorHub, SensorInput, SensorSample, SensorSource,
    SimulatedSensor, GRIPPER_STEP,
};
pub use status::{StatusPublisher, StatusSnapshot};
pub use yaw::{YawMode, YawNormalizer};
