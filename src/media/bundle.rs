//! Media bundles
//!
//! One capture cycle from the execution node: encoded images keyed by logical
//! channel name plus an optional encoded audio segment. The relay re-wraps a
//! bundle into a `MediaBroadcast` envelope for the producer.

use crate::telemetry::WireError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current media format version
pub const MEDIA_VERSION: u32 = 1;

/// Encoded audio carried in a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    /// Codec identifier, e.g. `opus` or `pcm_s16le`
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Bytes,
    #[serde(alias = "timestamp")]
    pub capture_time: f64,
}

/// Combined capture from the execution node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBundle {
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub sequence: u64,

    #[serde(alias = "timestamp")]
    pub capture_time: f64,

    /// Logical channel name to encoded image
    #[serde(default)]
    pub video: BTreeMap<String, Bytes>,

    #[serde(default)]
    pub audio: Option<AudioPayload>,

    /// Robot state reported by the execution node, if any
    #[serde(default)]
    pub state: Option<Vec<f64>>,

    /// Marks the last bundle of an episode
    #[serde(default)]
    pub episode_end: Option<bool>,
}

impl MediaBundle {
    pub fn new(sequence: u64, capture_time: f64) -> Self {
        Self {
            version: Some(MEDIA_VERSION),
            sequence,
            capture_time,
            video: BTreeMap::new(),
            audio: None,
            state: None,
            episode_end: None,
        }
    }

    pub fn with_video(mut self, channel: impl Into<String>, image: impl Into<Bytes>) -> Self {
        self.video.insert(channel.into(), image.into());
        self
    }

    pub fn with_audio(mut self, audio: AudioPayload) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn ends_episode(&self) -> bool {
        self.episode_end.unwrap_or(false)
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let bundle: Self = rmp_serde::from_slice(raw)?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if let Some(version) = self.version {
            if version == 0 || version > MEDIA_VERSION {
                return Err(WireError::UnsupportedVersion(version));
            }
        }
        if !self.capture_time.is_finite() {
            return Err(WireError::Invalid("non-finite capture_time".to_string()));
        }
        if self.video.is_empty() && self.audio.is_none() {
            return Err(WireError::Invalid("bundle carries no media".to_string()));
        }
        for (channel, image) in &self.video {
            if channel.trim().is_empty() {
                return Err(WireError::Invalid("empty video channel name".to_string()));
            }
            if image.is_empty() {
                return Err(WireError::Invalid(format!("empty image on channel {}", channel)));
            }
        }
        if let Some(audio) = &self.audio {
            if audio.data.is_empty() || audio.sample_rate == 0 || audio.channels == 0 {
                return Err(WireError::Invalid("malformed audio payload".to_string()));
            }
        }
        Ok(())
    }
}

/// Bundle as re-published by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBroadcast {
    pub version: u32,
    pub sequence: u64,
    pub capture_time: f64,
    /// When the relay forwarded it
    pub relay_time: f64,
    pub video: BTreeMap<String, Bytes>,
    #[serde(default)]
    pub audio: Option<AudioPayload>,
}

impl MediaBroadcast {
    /// Re-wrap a bundle. Media payloads are passed through untouched.
    pub fn wrap(bundle: MediaBundle, relay_time: f64) -> Self {
        Self {
            version: MEDIA_VERSION,
            sequence: bundle.sequence,
            capture_time: bundle.capture_time,
            relay_time,
            video: bundle.video,
            audio: bundle.audio,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let message: Self = rmp_serde::from_slice(raw)?;
        if message.version == 0 || message.version > MEDIA_VERSION {
            return Err(WireError::UnsupportedVersion(message.version));
        }
        Ok(message)
    }

    /// Back to a bundle for demultiplexing
    pub fn into_bundle(self) -> MediaBundle {
        MediaBundle {
            version: Some(self.version),
            sequence: self.sequence,
            capture_time: self.capture_time,
            video: self.video,
            audio: self.audio,
            state: None,
            episode_end: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio() -> AudioPayload {
        AudioPayload {
            codec: "pcm_s16le".to_string(),
            sample_rate: 48000,
            channels: 1,
            data: Bytes::from_static(&[1, 0, 2, 0]),
            capture_time: 5.0,
        }
    }

    #[test]
    fn test_bundle_decode_keeps_binary_payloads() {
        let bundle = MediaBundle::new(7, 5.0)
            .with_video("left", vec![0xffu8, 0xd8, 0x00])
            .with_audio(audio());
        let decoded = MediaBundle::decode(&bundle.encode().unwrap()).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(decoded.video["left"].as_ref(), &[0xff, 0xd8, 0x00]);
    }

    #[test]
    fn test_bundle_validation() {
        let empty = MediaBundle::new(1, 1.0);
        assert!(matches!(empty.validate(), Err(WireError::Invalid(_))));

        let audio_only = MediaBundle::new(1, 1.0).with_audio(audio());
        assert!(audio_only.validate().is_ok());

        let blank = MediaBundle::new(1, 1.0).with_video("top", Vec::<u8>::new());
        assert!(blank.validate().is_err());

        let mut future = MediaBundle::new(1, 1.0).with_video("top", vec![1u8]);
        future.version = Some(MEDIA_VERSION + 1);
        assert!(matches!(future.validate(), Err(WireError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_broadcast_wraps_without_touching_media() {
        let bundle = MediaBundle::new(42, 9.5)
            .with_video("left", vec![1u8, 2, 3])
            .with_video("top", vec![4u8, 5]);
        let wrapped = MediaBroadcast::wrap(bundle.clone(), 9.75);
        let decoded = MediaBroadcast::decode(&wrapped.encode().unwrap()).unwrap();

        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.capture_time, 9.5);
        assert_eq!(decoded.relay_time, 9.75);
        assert_eq!(decoded.video, bundle.video);
        assert!(decoded.audio.is_none());
    }
}
