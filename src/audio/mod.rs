//! Audio pipeline
//!
//! The jitter buffer between network arrival and the output clock, and the
//! playback drivers that pull from it.

pub mod jitter;
pub mod playback;

pub use jitter::{AudioSegment, BufferState, JitterBuffer, JitterStats};
#[cfg(feature = "playback")]
pub use playback::CpalPlayback;
pub use playback::{AudioSink, NullSink, PlaybackClock, PlaybackError, SegmentCursor};
