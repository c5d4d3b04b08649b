//! Audio playback
//!
//! The output side of the jitter buffer. `PlaybackClock` pulls one segment
//! per nominal frame duration on its own thread and hands it to an
//! `AudioSink`. With the `playback` feature, `CpalPlayback` lets the sound
//! card's callback drive the pull instead. Neither path touches the network.

use super::jitter::JitterBuffer;
use crate::utils::Shutdown;
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Playback errors
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No audio output device")]
    NoDevice,

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Destination for played samples
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[i16]);
}

/// Discards audio, counting samples. Keeps the buffer draining on headless
/// nodes so underrun statistics stay meaningful.
#[derive(Debug, Default, Clone)]
pub struct NullSink {
    written: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, samples: &[i16]) {
        self.written.fetch_add(samples.len() as u64, Ordering::Relaxed);
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Fixed-rate pull loop on a dedicated thread
pub struct PlaybackClock {
    running: Arc<AtomicBool>,
    handle: ParkingMutex<Option<JoinHandle<()>>>,
}

impl PlaybackClock {
    pub fn start(jitter: Arc<JitterBuffer>, mut sink: Box<dyn AudioSink>, shutdown: Shutdown) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let is_running = running.clone();
        let period = jitter.frame_duration();

        let handle = std::thread::spawn(move || {
            tracing::info!("Playback clock started ({:?} per segment)", period);
            let mut next = Instant::now();
            let mut samples = Vec::with_capacity(jitter.segment_len());

            while is_running.load(Ordering::Relaxed) && !shutdown.is_triggered() {
                jitter.pull_into(&mut samples);
                sink.write(&samples);

                next += period;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else if now - next > period * 4 {
                    // Fell far behind (suspend, debugger); don't burst to catch up
                    next = now;
                }
            }

            tracing::info!("Playback clock stopped");
        });

        Self {
            running,
            handle: ParkingMutex::new(Some(handle)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for the thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackClock {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Adapts fixed-size segments to arbitrary callback buffer sizes. Buffers
/// are allocated up front and reused, so steady-state callbacks do not
/// allocate.
pub struct SegmentCursor {
    jitter: Arc<JitterBuffer>,
    current: Vec<i16>,
    position: usize,
    scratch: Vec<i16>,
}

impl SegmentCursor {
    pub fn new(jitter: Arc<JitterBuffer>) -> Self {
        let segment_len = jitter.segment_len();
        Self {
            jitter,
            current: Vec::with_capacity(segment_len),
            position: 0,
            scratch: Vec::with_capacity(segment_len),
        }
    }

    /// Fill `out` completely, pulling segments as needed
    pub fn fill(&mut self, out: &mut [i16]) {
        let mut written = 0;
        while written < out.len() {
            if self.position >= self.current.len() {
                self.jitter.pull_into(&mut self.current);
                self.position = 0;
                if self.current.is_empty() {
                    out[written..].fill(0);
                    return;
                }
            }
            let n = (self.current.len() - self.position).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.current[self.position..self.position + n]);
            self.position += n;
            written += n;
        }
    }

    /// Same as `fill`, converted to f32 in [-1, 1)
    pub fn fill_f32(&mut self, out: &mut [f32]) {
        let mut scratch = std::mem::take(&mut self.scratch);
        // Only grows when the device hands us a larger buffer than before
        if scratch.len() < out.len() {
            scratch.resize(out.len(), 0);
        }
        self.fill(&mut scratch[..out.len()]);
        for (dst, src) in out.iter_mut().zip(&scratch) {
            *dst = *src as f32 / 32768.0;
        }
        self.scratch = scratch;
    }

    /// Capacity of the reusable conversion buffer
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }
}

// =============================================================================
// Device
// =============================================================================

/// Plays the jitter buffer on the default output device
#[cfg(feature = "playback")]
pub struct CpalPlayback {
    running: Arc<AtomicBool>,
    handle: ParkingMutex<Option<JoinHandle<()>>>,
}

#[cfg(feature = "playback")]
impl CpalPlayback {
    pub fn start(jitter: Arc<JitterBuffer>, sample_rate: u32, channels: u16) -> Result<Self, PlaybackError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::StreamConfig;

        if cpal::default_host().default_output_device().is_none() {
            return Err(PlaybackError::NoDevice);
        }

        let running = Arc::new(AtomicBool::new(true));
        let is_running = running.clone();

        // cpal streams are not Send, so the stream lives on its own thread
        let handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    tracing::error!("Failed to get default output device");
                    return;
                }
            };
            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

            let stream_config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let mut cursor = SegmentCursor::new(jitter);
            let stream = device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| cursor.fill_f32(data),
                |err| tracing::error!("Audio output stream error: {}", err),
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to build output stream: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!("Failed to start audio stream: {}", e);
                return;
            }

            tracing::info!(
                "Audio playback started on {} ({}Hz, {}ch)",
                device_name,
                sample_rate,
                channels
            );

            while is_running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }

            tracing::info!("Audio playback stopped");
        });

        Ok(Self {
            running,
            handle: ParkingMutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "playback")]
impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
