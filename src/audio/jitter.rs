//! Jitter buffer
//!
//! Bounded FIFO of decoded audio segments between the network receive path
//! and the output clock. `push` and `pull` never block beyond the short queue
//! lock. Overflow drops the oldest segment; underrun yields silence and sends
//! the buffer back to prebuffering.

use crate::config::JitterConfig;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Buffer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferState {
    /// Nothing received yet
    Empty,
    /// Accumulating up to the minimum fill
    Filling,
    /// Minimum fill reached, playback not started
    Ready,
    /// Playback consuming segments
    Draining,
}

/// One decoded segment of interleaved i16 samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    samples: Vec<i16>,
    capture_time: f64,
    sequence: u64,
    silence: bool,
}

impl AudioSegment {
    pub fn new(samples: Vec<i16>, capture_time: f64, sequence: u64) -> Self {
        Self {
            samples,
            capture_time,
            sequence,
            silence: false,
        }
    }

    /// Zeroed segment of `len` samples
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0; len],
            capture_time: 0.0,
            sequence: 0,
            silence: true,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn capture_time(&self) -> f64 {
        self.capture_time
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_silence(&self) -> bool {
        self.silence
    }
}

/// Buffer counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitterStats {
    pub state: BufferState,
    pub depth: usize,
    pub pushed: u64,
    pub played: u64,
    pub underruns: u64,
    pub overflows: u64,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<AudioSegment>,
    state: BufferState,
    pushed: u64,
    played: u64,
    underruns: u64,
    overflows: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    capacity: usize,
    min_fill: usize,
    silence_len: usize,
    frame_duration: Duration,
    inner: ParkingMutex<Inner>,
}

impl JitterBuffer {
    pub fn new(config: &JitterConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            min_fill: config.min_fill.clamp(1, capacity),
            silence_len: config.segment_len(),
            frame_duration: config.frame_duration(),
            inner: ParkingMutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                state: BufferState::Empty,
                pushed: 0,
                played: 0,
                underruns: 0,
                overflows: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_fill(&self) -> usize {
        self.min_fill
    }

    /// Nominal duration of one segment; the output clock pulls at this rate
    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Length of the silence returned on underrun
    pub fn segment_len(&self) -> usize {
        self.silence_len
    }

    /// Queue a segment, dropping the oldest when full
    pub fn push(&self, segment: AudioSegment) {
        let mut inner = self.inner.lock();

        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            inner.overflows += 1;
        }
        inner.queue.push_back(segment);
        inner.pushed += 1;

        if inner.state == BufferState::Empty {
            inner.state = BufferState::Filling;
        }
        if inner.state == BufferState::Filling && inner.queue.len() >= self.min_fill {
            inner.state = BufferState::Ready;
        }
    }

    /// Next segment for the output clock, or silence
    pub fn pull(&self) -> AudioSegment {
        self.pop_for_playback()
            .unwrap_or_else(|| AudioSegment::silence(self.silence_len))
    }

    /// Like `pull`, copying into `out` so the caller's buffer is reused.
    /// Returns false when `out` was filled with silence.
    pub fn pull_into(&self, out: &mut Vec<i16>) -> bool {
        out.clear();
        match self.pop_for_playback() {
            Some(segment) => {
                out.extend_from_slice(segment.samples());
                true
            }
            None => {
                out.resize(self.silence_len, 0);
                false
            }
        }
    }

    /// `None` means the output should play silence
    fn pop_for_playback(&self) -> Option<AudioSegment> {
        let mut inner = self.inner.lock();

        match inner.state {
            BufferState::Empty | BufferState::Filling => {
                // Prebuffering withholds queued audio; only a dry queue counts
                if inner.queue.is_empty() {
                    inner.underruns += 1;
                }
                None
            }
            BufferState::Ready | BufferState::Draining => match inner.queue.pop_front() {
                Some(segment) => {
                    inner.state = BufferState::Draining;
                    inner.played += 1;
                    Some(segment)
                }
                None => {
                    inner.underruns += 1;
                    inner.state = BufferState::Filling;
                    None
                }
            },
        }
    }

    /// Drop everything and start over
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.state = BufferState::Empty;
    }

    pub fn state(&self) -> BufferState {
        self.inner.lock().state
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn stats(&self) -> JitterStats {
        let inner = self.inner.lock();
        JitterStats {
            state: inner.state,
            depth: inner.queue.len(),
            pushed: inner.pushed,
            played: inner.played,
            underruns: inner.underruns,
            overflows: inner.overflows,
        }
    }
}
