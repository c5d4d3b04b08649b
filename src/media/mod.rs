//! Media
//!
//! Bundle wire types, image/audio codecs and the demultiplexer that feeds
//! per-channel frame slots and the jitter buffer.

pub mod bundle;
pub mod codec;
pub mod demux;

pub use bundle::{AudioPayload, MediaBroadcast, MediaBundle};
pub use codec::{AudioDecoder, AudioDecoders, CodecError, DecodedFrame, FrameDecoder, JpegFrameDecoder, PcmDecoder};
pub use demux::{DemuxOutcome, DemuxStats, Demultiplexer, FrameBoard};
