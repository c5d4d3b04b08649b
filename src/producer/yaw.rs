//! Yaw normalization
//!
//! IMU yaw is relative to wherever the sensor powered up. Each source gets
//! its own normalizer so all links share a common zero.

use serde::{Deserialize, Serialize};

/// First-sample yaw beyond this many degrees counts as a boundary start
pub const BOUNDARY_THRESHOLD_DEG: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YawMode {
    /// First valid sample becomes zero
    Normal,
    /// Offset of ±180 when the first sample is near the boundary, else the
    /// first sample
    Auto,
    /// Flip values beyond the threshold by 180
    Simple,
    /// Raw yaw
    Off,
}

impl Default for YawMode {
    fn default() -> Self {
        Self::Normal
    }
}

/// Wrap to [-180, 180]
fn wrap_degrees(angle: f64) -> f64 {
    if angle > 180.0 {
        angle - 360.0
    } else if angle < -180.0 {
        angle + 360.0
    } else {
        angle
    }
}

#[derive(Debug, Clone)]
pub struct YawNormalizer {
    mode: YawMode,
    offset: Option<f64>,
}

impl YawNormalizer {
    pub fn new(mode: YawMode) -> Self {
        Self { mode, offset: None }
    }

    pub fn mode(&self) -> YawMode {
        self.mode
    }

    /// Offset latched from the first sample, if any
    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn normalize(&mut self, yaw: f64) -> f64 {
        match self.mode {
            YawMode::Off => yaw,
            YawMode::Simple => {
                if yaw > BOUNDARY_THRESHOLD_DEG {
                    yaw - 180.0
                } else if yaw < -BOUNDARY_THRESHOLD_DEG {
                    yaw + 180.0
                } else {
                    yaw
                }
            }
            YawMode::Normal | YawMode::Auto => match self.offset {
                Some(offset) => wrap_degrees(yaw - offset),
                None => {
                    let offset = if self.mode == YawMode::Auto && yaw.abs() > BOUNDARY_THRESHOLD_DEG {
                        180.0_f64.copysign(yaw)
                    } else {
                        yaw
                    };
                    tracing::debug!("Yaw zeroed ({:?}): raw {:.2}, offset {:.2}", self.mode, yaw, offset);
                    self.offset = Some(offset);
                    0.0
                }
            },
        }
    }

    /// Forget the latched offset
    pub fn reset(&mut self) {
        self.offset = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_mode_zeroes_first_sample() {
        let mut yaw = YawNormalizer::new(YawMode::Normal);
        assert_eq!(yaw.normalize(170.0), 0.0);
        assert_eq!(yaw.normalize(175.0), 5.0);
        // 170 -> -170 crosses the seam
        assert_eq!(yaw.normalize(-170.0), 20.0);
        assert_eq!(yaw.offset(), Some(170.0));
    }

    #[test]
    fn test_auto_mode_boundary_offset() {
        let mut yaw = YawNormalizer::new(YawMode::Auto);
        assert_eq!(yaw.normalize(-150.0), 0.0);
        assert_eq!(yaw.offset(), Some(-180.0));
        assert_eq!(yaw.normalize(-140.0), 40.0);

        let mut yaw = YawNormalizer::new(YawMode::Auto);
        yaw.normalize(20.0);
        assert_eq!(yaw.offset(), Some(20.0));
    }

    #[test]
    fn test_simple_and_off() {
        let mut simple = YawNormalizer::new(YawMode::Simple);
        assert_eq!(simple.normalize(150.0), -30.0);
        assert_eq!(simple.normalize(-120.0), 60.0);
        assert_eq!(simple.normalize(50.0), 50.0);

        let mut off = YawNormalizer::new(YawMode::Off);
        assert_eq!(off.normalize(150.0), 150.0);
        assert_eq!(off.offset(), None);
    }

    #[test]
    fn test_mode_names() {
        let mode: YawMode = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(mode, YawMode::Auto);
        assert_eq!(YawMode::default(), YawMode::Normal);
    }
}
