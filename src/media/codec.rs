//! Media codecs
//!
//! Image decoding to display-ready RGB frames and audio decoding to
//! interleaved i16 PCM. Decoders are chosen by the codec id carried in each
//! audio payload; `pcm_s16le` is always available, `opus` with the `opus`
//! feature.

use super::bundle::AudioPayload;
use image::ImageFormat;
use std::collections::HashMap;
use thiserror::Error;

/// Codec errors. Each one drops a single image or audio segment.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported audio codec '{0}'")]
    UnsupportedCodec(String),

    #[error("Malformed audio payload: {0}")]
    Malformed(String),

    #[error("Audio format {got_rate} Hz/{got_channels} ch does not match output {want_rate} Hz/{want_channels} ch")]
    FormatMismatch {
        got_rate: u32,
        got_channels: u16,
        want_rate: u32,
        want_channels: u16,
    },

    #[error("Opus error: {0}")]
    Opus(String),
}

// =============================================================================
// Video
// =============================================================================

/// Display-ready frame for one logical channel
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub channel: String,
    pub sequence: u64,
    pub capture_time: f64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 rows
    pub rgb: Vec<u8>,
}

/// Turns encoded image bytes into pixels
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<(u32, u32, Vec<u8>), CodecError>;
}

/// JPEG images from the execution node's cameras
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegFrameDecoder;

impl FrameDecoder for JpegFrameDecoder {
    fn decode(&self, data: &[u8]) -> Result<(u32, u32, Vec<u8>), CodecError> {
        let rgb = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok((width, height, rgb.into_raw()))
    }
}

// =============================================================================
// Audio
// =============================================================================

/// Decodes one audio payload to interleaved i16 samples
pub trait AudioDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Raw little-endian 16-bit PCM
#[derive(Debug, Default)]
pub struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        if data.len() % 2 != 0 {
            return Err(CodecError::Malformed(format!(
                "odd PCM byte count {}",
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

#[cfg(feature = "opus")]
pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: usize,
}

// SAFETY: the decoder state is only touched through `&mut self`.
#[cfg(feature = "opus")]
unsafe impl Send for OpusDecoder {}

#[cfg(feature = "opus")]
impl OpusDecoder {
    /// Largest Opus frame, 120ms @ 48kHz
    const MAX_FRAME_SAMPLES: usize = 5760;

    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let layout = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => return Err(CodecError::Opus(format!("unsupported channel count {}", n))),
        };
        let decoder = opus::Decoder::new(sample_rate, layout)
            .map_err(|e| CodecError::Opus(format!("Failed to create Opus decoder: {:?}", e)))?;
        Ok(Self {
            decoder,
            channels: channels as usize,
        })
    }
}

#[cfg(feature = "opus")]
impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0i16; Self::MAX_FRAME_SAMPLES * self.channels];
        let samples = self
            .decoder
            .decode(data, &mut output, false)
            .map_err(|e| CodecError::Opus(format!("Opus decoding failed: {:?}", e)))?;
        output.truncate(samples * self.channels);
        Ok(output)
    }
}

/// Per-codec decoders for a fixed output format
///
/// Decoders are created on first use and kept, so stateful codecs see a
/// continuous stream.
pub struct AudioDecoders {
    sample_rate: u32,
    channels: u16,
    decoders: HashMap<String, Box<dyn AudioDecoder>>,
}

impl AudioDecoders {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            decoders: HashMap::new(),
        }
    }

    /// Decode one payload into output-format samples
    pub fn decode(&mut self, payload: &AudioPayload) -> Result<Vec<i16>, CodecError> {
        if payload.sample_rate != self.sample_rate || payload.channels != self.channels {
            return Err(CodecError::FormatMismatch {
                got_rate: payload.sample_rate,
                got_channels: payload.channels,
                want_rate: self.sample_rate,
                want_channels: self.channels,
            });
        }

        if !self.decoders.contains_key(&payload.codec) {
            let decoder = create_decoder(&payload.codec, self.sample_rate, self.channels)?;
            tracing::info!("Created {} audio decoder", payload.codec);
            self.decoders.insert(payload.codec.clone(), decoder);
        }

        match self.decoders.get_mut(&payload.codec) {
            Some(decoder) => decoder.decode(&payload.data),
            None => Err(CodecError::UnsupportedCodec(payload.codec.clone())),
        }
    }
}

#[cfg_attr(not(feature = "opus"), allow(unused_variables))]
fn create_decoder(
    codec: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<Box<dyn AudioDecoder>, CodecError> {
    match codec {
        "pcm_s16le" | "pcm" => Ok(Box::new(PcmDecoder)),
        #[cfg(feature = "opus")]
        "opus" => Ok(Box::new(OpusDecoder::new(sample_rate, channels)?)),
        other => Err(CodecError::UnsupportedCodec(other.to_string())),
    }
}
