//! Telemetry/media pairing
//!
//! The relay keeps the latest accepted telemetry and pairs each media bundle
//! with it when their capture times are close enough.

use crate::media::MediaBundle;
use crate::recorder::RecordSample;
use crate::telemetry::RelayTelemetry;

pub struct Pairer {
    latest: Option<RelayTelemetry>,
    max_skew: f64,
    paired: u64,
    unpaired: u64,
}

impl Pairer {
    /// `max_skew` in seconds
    pub fn new(max_skew: f64) -> Self {
        Self {
            latest: None,
            max_skew,
            paired: 0,
            unpaired: 0,
        }
    }

    /// Remember accepted telemetry
    pub fn observe(&mut self, telemetry: RelayTelemetry) {
        self.latest = Some(telemetry);
    }

    /// Pair a bundle with the latest telemetry, if close enough in time
    pub fn pair(&mut self, bundle: &MediaBundle) -> Option<RecordSample> {
        let telemetry = match &self.latest {
            Some(t) if (bundle.capture_time - t.capture_time).abs() <= self.max_skew => t.clone(),
            _ => {
                self.unpaired += 1;
                return None;
            }
        };

        self.paired += 1;
        Some(RecordSample {
            telemetry,
            bundle: bundle.clone(),
        })
    }

    pub fn paired(&self) -> u64 {
        self.paired
    }

    pub fn unpaired(&self) -> u64 {
        self.unpaired
    }
}
