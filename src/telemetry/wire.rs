//! Wire encodings
//!
//! Three views of the canonical frame: a flat JSON record for the simulation
//! consumer, a named MessagePack record for the relay, and the JSON command
//! the relay forwards to the execution node. Decoding validates required
//! fields and rejects malformed input with a `WireError`.

use super::frame::{EulerAngles, SourceEuler, TelemetryError, TelemetryFrame};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current relay-leg format version
pub const WIRE_VERSION: u32 = 1;

/// Discriminator carried by control messages
pub const CONTROL_TYPE: &str = "control";

/// Fixed auxiliary scalar expected by the execution node
pub const THROTTLE: f64 = 0.0;

/// Wire decode/encode errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Message has no type discriminator")]
    MissingDiscriminator,

    #[error("Unexpected message type '{0}'")]
    UnexpectedType(String),

    #[error("Unsupported message version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

// =============================================================================
// Simulation Leg
// =============================================================================

/// Flat record consumed by the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationMessage {
    pub position: [f64; 3],
    pub orientation: [f64; 3],
    pub gripper: f64,
    #[serde(alias = "t")]
    pub capture_time: f64,
}

impl SimulationMessage {
    pub fn from_frame(frame: &TelemetryFrame) -> Self {
        Self {
            position: frame.position(),
            orientation: frame.orientation(),
            gripper: frame.gripper(),
            capture_time: frame.capture_time(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

// =============================================================================
// Relay Leg
// =============================================================================

/// Structured record sent to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayTelemetry {
    /// Absent on malformed senders; checked by `validate`
    #[serde(rename = "type", default)]
    pub msg_type: Option<String>,

    #[serde(default)]
    pub version: Option<u32>,

    pub capture_time: f64,

    /// Orientation in degrees
    pub euler_angles: EulerAngles,

    pub position: [f64; 3],

    /// Orientation in radians
    pub orientation: [f64; 3],

    pub gripper: f64,

    #[serde(default)]
    pub throttle: f64,

    #[serde(default)]
    pub sources: Vec<SourceEuler>,
}

impl RelayTelemetry {
    pub fn from_frame(frame: &TelemetryFrame) -> Self {
        Self {
            msg_type: Some(CONTROL_TYPE.to_string()),
            version: Some(WIRE_VERSION),
            capture_time: frame.capture_time(),
            euler_angles: frame.orientation_degrees(),
            position: frame.position(),
            orientation: frame.orientation(),
            gripper: frame.gripper(),
            throttle: THROTTLE,
            sources: frame.sources().to_vec(),
        }
    }

    /// Named-field MessagePack
    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// Decode and validate
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let message: Self = rmp_serde::from_slice(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        match self.msg_type.as_deref() {
            None => return Err(WireError::MissingDiscriminator),
            Some(CONTROL_TYPE) => {}
            Some(other) => return Err(WireError::UnexpectedType(other.to_string())),
        }
        if let Some(version) = self.version {
            if version == 0 || version > WIRE_VERSION {
                return Err(WireError::UnsupportedVersion(version));
            }
        }
        if !self.euler_angles.is_finite() || !self.throttle.is_finite() {
            return Err(WireError::Invalid("non-finite euler angles or throttle".to_string()));
        }
        // Remaining field checks are shared with the canonical frame
        self.to_frame().map(|_| ())
    }

    /// Rebuild the canonical frame this record was derived from
    pub fn to_frame(&self) -> Result<TelemetryFrame, WireError> {
        Ok(TelemetryFrame::new(
            self.position,
            self.orientation,
            self.gripper,
            self.sources.clone(),
            self.capture_time,
        )?)
    }
}

// =============================================================================
// Execution Leg
// =============================================================================

/// Command forwarded by the relay to the execution node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCommand {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub euler_angles: EulerAngles,
    pub position: [f64; 3],
    pub orientation: [f64; 3],
    pub gripper: f64,
    pub throttle: f64,
    pub timestamp: f64,
}

impl ExecutionCommand {
    pub fn from_relay(message: &RelayTelemetry) -> Self {
        Self {
            msg_type: CONTROL_TYPE.to_string(),
            euler_angles: message.euler_angles,
            position: message.position,
            orientation: message.orientation,
            gripper: message.gripper,
            throttle: message.throttle,
            timestamp: message.capture_time,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_frame() -> TelemetryFrame {
        TelemetryFrame::new(
            [0.30, 0.0, 0.25],
            [0.1, -0.2, 0.0],
            0.5,
            vec![SourceEuler::new("imu3", EulerAngles::new(5.7, -11.4, 0.0))],
            1_700_000_000.123_456,
        )
        .unwrap()
    }

    #[test]
    fn test_both_legs_decode_to_identical_values() {
        let frame = scenario_frame();

        let sim = SimulationMessage::decode(&SimulationMessage::from_frame(&frame).encode().unwrap()).unwrap();
        let relay = RelayTelemetry::decode(&RelayTelemetry::from_frame(&frame).encode().unwrap()).unwrap();

        assert_eq!(sim.position, [0.30, 0.0, 0.25]);
        assert_eq!(sim.orientation, [0.1, -0.2, 0.0]);
        assert_eq!(sim.gripper, 0.5);

        assert_eq!(sim.position, relay.position);
        assert_eq!(sim.orientation, relay.orientation);
        assert_eq!(sim.gripper, relay.gripper);
        assert_eq!(sim.capture_time.to_bits(), relay.capture_time.to_bits());
        assert_eq!(relay.to_frame().unwrap(), frame);
    }

    #[test]
    fn test_awkward_floats_survive_text_encoding() {
        let frame = TelemetryFrame::new(
            [0.1 + 0.2, 1.0 / 3.0, -2.0e-17],
            [std::f64::consts::PI, -1e-300, 0.0],
            0.999_999_999_999_999_9,
            vec![],
            1_712_345_678.987_654_3,
        )
        .unwrap();

        let sim = SimulationMessage::decode(&SimulationMessage::from_frame(&frame).encode().unwrap()).unwrap();
        let relay = RelayTelemetry::decode(&RelayTelemetry::from_frame(&frame).encode().unwrap()).unwrap();
        for i in 0..3 {
            assert_eq!(sim.position[i].to_bits(), relay.position[i].to_bits());
            assert_eq!(sim.orientation[i].to_bits(), relay.orientation[i].to_bits());
        }
        assert_eq!(sim.gripper.to_bits(), relay.gripper.to_bits());
        assert_eq!(sim.capture_time.to_bits(), frame.capture_time().to_bits());
    }

    #[test]
    fn test_simulation_accepts_legacy_time_key() {
        let raw = json!({
            "position": [1.0, 2.0, 3.0],
            "orientation": [0.0, 0.0, 0.0],
            "gripper": 0.0,
            "t": 12.5
        });
        let msg = SimulationMessage::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(msg.capture_time, 12.5);
    }

    #[test]
    fn test_relay_leg_carries_degrees_and_discriminator() {
        let relay = RelayTelemetry::from_frame(&scenario_frame());
        assert_eq!(relay.msg_type.as_deref(), Some("control"));
        assert_eq!(relay.throttle, 0.0);
        assert!((relay.euler_angles.roll - 0.1f64.to_degrees()).abs() < 1e-12);
        assert!((relay.euler_angles.pitch + 0.2f64.to_degrees()).abs() < 1e-12);
    }

    #[test]
    fn test_relay_decode_rejects_missing_discriminator() {
        let mut relay = RelayTelemetry::from_frame(&scenario_frame());
        relay.msg_type = None;
        let raw = rmp_serde::to_vec_named(&relay).unwrap();
        assert!(matches!(
            RelayTelemetry::decode(&raw),
            Err(WireError::MissingDiscriminator)
        ));

        relay.msg_type = Some("heartbeat".to_string());
        let raw = rmp_serde::to_vec_named(&relay).unwrap();
        assert!(matches!(
            RelayTelemetry::decode(&raw),
            Err(WireError::UnexpectedType(t)) if t == "heartbeat"
        ));
    }

    #[test]
    fn test_relay_decode_rejects_bad_values_and_garbage() {
        let mut relay = RelayTelemetry::from_frame(&scenario_frame());
        relay.gripper = 3.0;
        let raw = rmp_serde::to_vec_named(&relay).unwrap();
        assert!(matches!(
            RelayTelemetry::decode(&raw),
            Err(WireError::Telemetry(TelemetryError::GripperOutOfRange(_)))
        ));

        relay.gripper = 0.5;
        relay.version = Some(WIRE_VERSION + 1);
        let raw = rmp_serde::to_vec_named(&relay).unwrap();
        assert!(matches!(
            RelayTelemetry::decode(&raw),
            Err(WireError::UnsupportedVersion(_))
        ));

        assert!(matches!(
            RelayTelemetry::decode(b"\xc1\xc1 not msgpack"),
            Err(WireError::MsgpackDecode(_))
        ));
    }

    #[test]
    fn test_execution_command_mirrors_relay_fields() {
        let relay = RelayTelemetry::from_frame(&scenario_frame());
        let command = ExecutionCommand::from_relay(&relay);
        let value: serde_json::Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "control");
        assert_eq!(value["position"], json!([0.30, 0.0, 0.25]));
        assert_eq!(value["gripper"], 0.5);
        assert_eq!(value["throttle"], 0.0);
        assert_eq!(value["timestamp"].as_f64(), Some(relay.capture_time));
        assert!(value["euler_angles"]["roll"].is_number());
    }
}
