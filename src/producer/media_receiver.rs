//! Media receiver
//!
//! Subscribes to the relay's media broadcast, demultiplexes every bundle into
//! the frame board and jitter buffer and records receive diagnostics.

use crate::media::{DemuxOutcome, Demultiplexer, MediaBroadcast};
use crate::telemetry::{Diagnostics, WireError};
use crate::transport::BroadcastSubscriber;
use crate::utils::unix_now;
use std::sync::Arc;

pub struct MediaReceiver {
    demux: Demultiplexer,
    diagnostics: Arc<Diagnostics>,
}

impl MediaReceiver {
    pub fn new(demux: Demultiplexer, diagnostics: Arc<Diagnostics>) -> Self {
        Self { demux, diagnostics }
    }

    pub fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    /// Handle one broadcast message received at `now`
    pub fn handle(&mut self, raw: &[u8], now: f64) -> Result<DemuxOutcome, WireError> {
        let bundle = match MediaBroadcast::decode(raw) {
            Ok(message) => message.into_bundle(),
            Err(e) => {
                self.diagnostics.record_decode_error();
                return Err(e);
            }
        };

        let capture_time = bundle.capture_time;
        let outcome = self.demux.demux(bundle);
        for _ in 0..(outcome.video_errors + usize::from(outcome.audio_error)) {
            self.diagnostics.record_decode_error();
        }
        self.diagnostics
            .record_media(capture_time, now, outcome.video_updates as u64, outcome.audio_segments as u64);
        Ok(outcome)
    }

    /// Receive until shutdown
    pub async fn run(mut self, mut subscriber: BroadcastSubscriber) {
        tracing::info!("Media receiver started on {}", subscriber.name());
        while let Some(raw) = subscriber.recv().await {
            if let Err(e) = self.handle(&raw, unix_now()) {
                tracing::warn!("Dropped media message ({} bytes): {}", raw.len(), e);
            }
        }
        tracing::info!("Media receiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::JitterBuffer;
    use crate::config::JitterConfig;
    use crate::media::codec::tests::{jpeg, pcm_payload};
    use crate::media::{FrameBoard, MediaBundle};

    #[test]
    fn test_broadcast_reaches_board_and_jitter() {
        let board = Arc::new(FrameBoard::new());
        let jitter = Arc::new(JitterBuffer::new(&JitterConfig {
            frame_samples: 4,
            ..Default::default()
        }));
        let diagnostics = Arc::new(Diagnostics::new());
        let mut receiver = MediaReceiver::new(
            Demultiplexer::new(board.clone(), Some(jitter.clone()), 48000, 1),
            diagnostics.clone(),
        );

        let bundle = MediaBundle::new(7, 100.0)
            .with_video("top", jpeg(4, 4, [10, 20, 30]))
            .with_video("wrist", b"broken".to_vec())
            .with_audio(pcm_payload(&[1, -1, 2, -2], 100.0));
        let raw = MediaBroadcast::wrap(bundle, 100.05).encode().unwrap();

        let outcome = receiver.handle(&raw, 100.25).unwrap();
        assert_eq!(outcome.video_updates, 1);
        assert_eq!(outcome.audio_segments, 1);
        assert_eq!(board.latest("top").unwrap().sequence, 7);
        assert_eq!(jitter.depth(), 1);

        let media = diagnostics.media_stats();
        assert_eq!(media.bundles_received, 1);
        assert_eq!(media.video_frames, 1);
        assert_eq!(media.audio_segments, 1);
        assert_eq!(media.decode_errors, 1);
        assert!((media.last_latency_secs.unwrap() - 0.25).abs() < 1e-9);

        assert!(receiver.handle(b"garbage", 101.0).is_err());
        assert_eq!(diagnostics.media_stats().decode_errors, 2);
    }
}
