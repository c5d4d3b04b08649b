//! Media demultiplexer
//!
//! Splits a bundle into per-channel video frames and audio. Every video
//! channel has its own latest-only slot. Decoded audio is re-chunked into
//! segments of exactly the jitter buffer's segment length before it is
//! queued; a partial tail waits for the next bundle. A failed decode drops
//! that one image or payload and is counted.

use super::bundle::MediaBundle;
use super::codec::{AudioDecoders, DecodedFrame, FrameDecoder, JpegFrameDecoder};
use crate::audio::{AudioSegment, JitterBuffer};
use crate::utils::LatestSlot;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Latest decoded frame per logical channel
#[derive(Debug, Default)]
pub struct FrameBoard {
    slots: ParkingMutex<BTreeMap<String, Arc<LatestSlot<DecodedFrame>>>>,
}

impl FrameBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `channel`, created on first use. Viewers may hold on to it.
    pub fn slot(&self, channel: &str) -> Arc<LatestSlot<DecodedFrame>> {
        let mut slots = self.slots.lock();
        match slots.get(channel) {
            Some(slot) => slot.clone(),
            None => {
                let slot = Arc::new(LatestSlot::new());
                slots.insert(channel.to_string(), slot.clone());
                slot
            }
        }
    }

    pub fn publish(&self, frame: DecodedFrame) {
        self.slot(&frame.channel).put(frame);
    }

    /// Copy of the latest frame without consuming it
    pub fn latest(&self, channel: &str) -> Option<DecodedFrame> {
        self.slots.lock().get(channel).and_then(|slot| slot.peek())
    }

    /// Consume the latest frame
    pub fn take(&self, channel: &str) -> Option<DecodedFrame> {
        let slot = self.slots.lock().get(channel).cloned();
        slot.and_then(|slot| slot.take())
    }

    pub fn channels(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }
}

/// What one bundle produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DemuxOutcome {
    pub video_updates: usize,
    pub video_errors: usize,
    /// Full segments queued for playback
    pub audio_segments: usize,
    pub audio_error: bool,
}

/// Running totals
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemuxStats {
    pub bundles: u64,
    pub video_frames: u64,
    pub video_errors: u64,
    pub audio_segments: u64,
    pub audio_errors: u64,
}

/// Decoder plus the re-chunking state in front of the jitter buffer
struct AudioPath {
    decoders: AudioDecoders,
    jitter: Arc<JitterBuffer>,
    pending: Vec<i16>,
    /// Capture time of `pending[0]`
    pending_start: f64,
    /// Interleaved samples per second
    sample_rate: f64,
}

impl AudioPath {
    fn new(jitter: Arc<JitterBuffer>, sample_rate: u32, channels: u16) -> Self {
        Self {
            decoders: AudioDecoders::new(sample_rate, channels),
            pending: Vec::with_capacity(jitter.segment_len() * 2),
            jitter,
            pending_start: 0.0,
            sample_rate: (sample_rate as f64 * channels as f64).max(1.0),
        }
    }

    /// Append decoded samples and queue every complete segment
    fn push_samples(&mut self, samples: &[i16], capture_time: f64, sequence: u64) -> usize {
        if self.pending.is_empty() {
            self.pending_start = capture_time;
        }
        self.pending.extend_from_slice(samples);

        let segment_len = self.jitter.segment_len();
        let mut queued = 0;
        let mut offset = 0;
        while self.pending.len() - offset >= segment_len {
            let chunk = self.pending[offset..offset + segment_len].to_vec();
            let start = self.pending_start + offset as f64 / self.sample_rate;
            self.jitter.push(AudioSegment::new(chunk, start, sequence));
            offset += segment_len;
            queued += 1;
        }

        self.pending.drain(..offset);
        self.pending_start += offset as f64 / self.sample_rate;
        queued
    }
}

pub struct Demultiplexer {
    board: Arc<FrameBoard>,
    frame_decoder: Box<dyn FrameDecoder>,
    audio: Option<AudioPath>,
    video_enabled: bool,
    stats: DemuxStats,
}

impl Demultiplexer {
    /// JPEG video into `board`; audio into `jitter` when given
    pub fn new(board: Arc<FrameBoard>, jitter: Option<Arc<JitterBuffer>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            board,
            frame_decoder: Box::new(JpegFrameDecoder),
            audio: jitter.map(|j| AudioPath::new(j, sample_rate, channels)),
            video_enabled: true,
            stats: DemuxStats::default(),
        }
    }

    pub fn with_frame_decoder(mut self, decoder: Box<dyn FrameDecoder>) -> Self {
        self.frame_decoder = decoder;
        self
    }

    /// Ignore video entries entirely
    pub fn without_video(mut self) -> Self {
        self.video_enabled = false;
        self
    }

    pub fn board(&self) -> &Arc<FrameBoard> {
        &self.board
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.clone()
    }

    /// Decoded samples waiting for a full segment
    pub fn pending_audio(&self) -> usize {
        self.audio.as_ref().map_or(0, |audio| audio.pending.len())
    }

    pub fn demux(&mut self, bundle: MediaBundle) -> DemuxOutcome {
        let mut outcome = DemuxOutcome::default();
        self.stats.bundles += 1;

        if self.video_enabled {
            for (channel, data) in &bundle.video {
                match self.frame_decoder.decode(data) {
                    Ok((width, height, rgb)) => {
                        self.board.publish(DecodedFrame {
                            channel: channel.clone(),
                            sequence: bundle.sequence,
                            capture_time: bundle.capture_time,
                            width,
                            height,
                            rgb,
                        });
                        outcome.video_updates += 1;
                    }
                    Err(e) => {
                        outcome.video_errors += 1;
                        tracing::debug!("Dropped frame {} on {}: {}", bundle.sequence, channel, e);
                    }
                }
            }
        }
        self.stats.video_frames += outcome.video_updates as u64;
        self.stats.video_errors += outcome.video_errors as u64;

        if let (Some(payload), Some(audio)) = (&bundle.audio, self.audio.as_mut()) {
            match audio.decoders.decode(payload) {
                Ok(samples) if !samples.is_empty() => {
                    outcome.audio_segments = audio.push_samples(&samples, payload.capture_time, bundle.sequence);
                    self.stats.audio_segments += outcome.audio_segments as u64;
                }
                Ok(_) => {
                    tracing::trace!("Empty audio segment in bundle {}", bundle.sequence);
                }
                Err(e) => {
                    outcome.audio_error = true;
                    self.stats.audio_errors += 1;
                    // Decoder errors tend to repeat for every bundle
                    if self.stats.audio_errors.is_power_of_two() {
                        tracing::warn!("Audio decode failed ({} total): {}", self.stats.audio_errors, e);
                    }
                }
            }
        }

        outcome
    }
}
