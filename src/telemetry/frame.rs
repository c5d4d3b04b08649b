//! Canonical telemetry model
//!
//! One `TelemetryFrame` is built per publish tick and every wire format is a
//! pure view of it. Construction validates the frame; it is immutable after.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Telemetry validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Gripper value {0} is outside [0, 1]")]
    GripperOutOfRange(f64),

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Roll/pitch/yaw triple. Units depend on context and are named at use sites.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }

    pub fn from_array(values: [f64; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.roll, self.pitch, self.yaw]
    }

    pub fn to_radians(self) -> Self {
        Self::new(self.roll.to_radians(), self.pitch.to_radians(), self.yaw.to_radians())
    }

    pub fn to_degrees(self) -> Self {
        Self::new(self.roll.to_degrees(), self.pitch.to_degrees(), self.yaw.to_degrees())
    }

    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw.is_finite()
    }
}

/// Latest angles of one upstream sensor, in degrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEuler {
    pub source_id: String,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl SourceEuler {
    pub fn new(source_id: impl Into<String>, angles: EulerAngles) -> Self {
        Self {
            source_id: source_id.into(),
            roll: angles.roll,
            pitch: angles.pitch,
            yaw: angles.yaw,
        }
    }

    pub fn angles(&self) -> EulerAngles {
        EulerAngles::new(self.roll, self.pitch, self.yaw)
    }
}

/// Current pose command
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    position: [f64; 3],
    orientation: [f64; 3],
    gripper: f64,
    sources: Vec<SourceEuler>,
    capture_time: f64,
}

impl TelemetryFrame {
    /// Build a frame. `position` in meters, `orientation` in radians,
    /// `capture_time` in unix seconds.
    pub fn new(
        position: [f64; 3],
        orientation: [f64; 3],
        gripper: f64,
        sources: Vec<SourceEuler>,
        capture_time: f64,
    ) -> Result<Self, TelemetryError> {
        if !position.iter().all(|v| v.is_finite()) {
            return Err(TelemetryError::NonFinite("position"));
        }
        if !orientation.iter().all(|v| v.is_finite()) {
            return Err(TelemetryError::NonFinite("orientation"));
        }
        if !gripper.is_finite() {
            return Err(TelemetryError::NonFinite("gripper"));
        }
        if !(0.0..=1.0).contains(&gripper) {
            return Err(TelemetryError::GripperOutOfRange(gripper));
        }
        if !capture_time.is_finite() {
            return Err(TelemetryError::NonFinite("capture_time"));
        }
        if !sources.iter().all(|s| s.angles().is_finite()) {
            return Err(TelemetryError::NonFinite("sources"));
        }

        Ok(Self {
            position,
            orientation,
            gripper,
            sources,
            capture_time,
        })
    }

    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    pub fn orientation(&self) -> [f64; 3] {
        self.orientation
    }

    /// Orientation as Euler angles in degrees
    pub fn orientation_degrees(&self) -> EulerAngles {
        EulerAngles::from_array(self.orientation).to_degrees()
    }

    pub fn gripper(&self) -> f64 {
        self.gripper
    }

    pub fn sources(&self) -> &[SourceEuler] {
        &self.sources
    }

    pub fn capture_time(&self) -> f64 {
        self.capture_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gripper_must_be_in_unit_range() {
        let err = TelemetryFrame::new([0.0; 3], [0.0; 3], 1.2, vec![], 0.0).unwrap_err();
        assert_eq!(err, TelemetryError::GripperOutOfRange(1.2));
        assert!(TelemetryFrame::new([0.0; 3], [0.0; 3], 1.0, vec![], 0.0).is_ok());
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let err = TelemetryFrame::new([f64::NAN, 0.0, 0.0], [0.0; 3], 0.5, vec![], 0.0).unwrap_err();
        assert_eq!(err, TelemetryError::NonFinite("position"));

        let sources = vec![SourceEuler::new("imu1", EulerAngles::new(0.0, f64::INFINITY, 0.0))];
        let err = TelemetryFrame::new([0.0; 3], [0.0; 3], 0.5, sources, 0.0).unwrap_err();
        assert_eq!(err, TelemetryError::NonFinite("sources"));
    }

    #[test]
    fn test_orientation_degrees() {
        let frame = TelemetryFrame::new(
            [0.0; 3],
            [std::f64::consts::FRAC_PI_2, 0.0, -std::f64::consts::PI],
            0.0,
            vec![],
            1.0,
        )
        .unwrap();
        let deg = frame.orientation_degrees();
        assert!((deg.roll - 90.0).abs() < 1e-9);
        assert!((deg.yaw + 180.0).abs() < 1e-9);
    }
}
