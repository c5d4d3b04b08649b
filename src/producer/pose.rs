//! Pose solving
//!
//! Turns the latest per-source Euler angles into an end-effector pose. The
//! reference solver is a two-link arm with one IMU per link and one on the
//! tool.

use crate::config::ArmConfig;
use crate::telemetry::EulerAngles;
use std::collections::BTreeMap;

/// Latest angles per source, in degrees
pub type SourceAngles = BTreeMap<String, EulerAngles>;

/// End-effector pose
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Target-workspace position in meters
    pub position: [f64; 3],
    /// Tool orientation in radians
    pub orientation: [f64; 3],
    /// Solved position before clipping and mapping
    pub raw_position: [f64; 3],
}

pub trait PoseSolver: Send + Sync {
    /// `None` when a required source has no angles yet
    fn solve(&self, angles: &SourceAngles) -> Option<Pose>;
}

/// Two links driven by their own IMUs, end position as the sum of the links
#[derive(Debug, Clone)]
pub struct TwoLinkArm {
    config: ArmConfig,
}

impl TwoLinkArm {
    pub fn new(config: ArmConfig) -> Self {
        Self { config }
    }

    /// `R · [length, 0, 0]` for extrinsic x-y-z angles in degrees
    pub fn link_vector(length: f64, angles: EulerAngles) -> [f64; 3] {
        let r = angles.to_radians();
        let (sp, cp) = r.pitch.sin_cos();
        let (sy, cy) = r.yaw.sin_cos();
        // Roll spins the link about its own axis and drops out
        [length * cy * cp, length * sy * cp, -length * sp]
    }

    /// Sum of both link vectors, in the raw workspace
    pub fn end_position(&self, link1: EulerAngles, link2: EulerAngles) -> [f64; 3] {
        let a = Self::link_vector(self.config.link1, link1);
        let b = Self::link_vector(self.config.link2, link2);
        [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
    }

    /// Clip to the raw workspace and map linearly onto the target workspace
    pub fn map_to_target(&self, raw: [f64; 3]) -> [f64; 3] {
        let c = &self.config;
        let mut mapped = [0.0; 3];
        for axis in 0..3 {
            let clipped = raw[axis].clamp(c.raw_min[axis], c.raw_max[axis]);
            let ratio = (clipped - c.raw_min[axis]) / (c.raw_max[axis] - c.raw_min[axis]);
            mapped[axis] = c.target_min[axis] + ratio * (c.target_max[axis] - c.target_min[axis]);
        }
        mapped
    }
}

impl PoseSolver for TwoLinkArm {
    fn solve(&self, angles: &SourceAngles) -> Option<Pose> {
        let link1 = angles.get(&self.config.link1_source)?;
        let link2 = angles.get(&self.config.link2_source)?;
        let tool = angles.get(&self.config.tool_source)?;

        let raw_position = self.end_position(*link1, *link2);
        Some(Pose {
            position: self.map_to_target(raw_position),
            orientation: tool.to_radians().to_array(),
            raw_position,
        })
    }
}
