//! Episode recorder
//!
//! Samples the relay's latest paired (telemetry, media) tuple at a fixed
//! cadence on its own thread and appends it to an episode store. Whatever
//! arrives between two cadence ticks collapses to the most recent sample.
//! Store failures are logged and counted here and never reach the relay. An
//! episode that never got a record written is discarded instead of saved.

use super::state::{EpisodeRecord, EpisodeSummary, RecordSample, RecorderState};
use super::store::{EpisodeStore, StoreError};
use crate::utils::{LatestSlot, Shutdown};
use parking_lot::{Mutex as ParkingMutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Recorder is already running")]
    AlreadyRunning,

    #[error("Recorder is not running")]
    NotRunning,

    #[error("Recorder thread panicked")]
    ThreadPanicked,
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Hand-off point between the relay and the recorder thread
#[derive(Debug, Default)]
pub struct RecordTap {
    slot: LatestSlot<RecordSample>,
    end_requested: AtomicBool,
}

impl RecordTap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a sample, replacing any not yet recorded
    pub fn offer(&self, sample: RecordSample) {
        self.slot.put(sample);
    }

    /// Close the current episode after the pending sample
    pub fn request_episode_end(&self) {
        self.end_requested.store(true, Ordering::SeqCst);
    }

    /// Samples replaced before the recorder saw them
    pub fn superseded(&self) -> u64 {
        self.slot.overwritten()
    }
}

/// Recorder counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    pub episodes: u64,
    /// Episodes dropped because no record was written
    pub discarded: u64,
    pub frames: u64,
    pub failures: u64,
    pub superseded: u64,
}

#[derive(Debug, Default)]
struct RecorderCounters {
    episodes: AtomicU64,
    discarded: AtomicU64,
    frames: AtomicU64,
    failures: AtomicU64,
}

/// Owns the recording thread
pub struct EpisodeRecorder {
    /// Current recorder state
    state: Arc<RwLock<RecorderState>>,

    /// Where the relay drops samples
    tap: Arc<RecordTap>,

    counters: Arc<RecorderCounters>,

    running: Arc<AtomicBool>,
    handle: ParkingMutex<Option<JoinHandle<Vec<EpisodeSummary>>>>,
}

impl EpisodeRecorder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RecorderState::Idle)),
            tap: Arc::new(RecordTap::new()),
            counters: Arc::new(RecorderCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            handle: ParkingMutex::new(None),
        }
    }

    pub fn tap(&self) -> Arc<RecordTap> {
        self.tap.clone()
    }

    pub fn state(&self) -> RecorderState {
        *self.state.read()
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            episodes: self.counters.episodes.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            superseded: self.tap.superseded(),
        }
    }

    /// Start the recording thread
    pub fn start(&self, store: Box<dyn EpisodeStore>, cadence: Duration, shutdown: Shutdown) -> RecorderResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(RecorderError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        *self.state.write() = RecorderState::Waiting;

        let record_loop = RecordLoop::new(
            store,
            self.tap.clone(),
            self.state.clone(),
            self.counters.clone(),
        );
        let running = self.running.clone();
        *handle = Some(std::thread::spawn(move || record_loop.run(cadence, running, shutdown)));

        tracing::info!("Recorder started ({:?} cadence)", cadence);
        Ok(())
    }

    /// Stop the thread, finalizing any open episode
    pub fn stop(&self) -> RecorderResult<Vec<EpisodeSummary>> {
        let handle = self.handle.lock().take().ok_or(RecorderError::NotRunning)?;
        self.running.store(false, Ordering::SeqCst);
        let episodes = handle.join().map_err(|_| RecorderError::ThreadPanicked)?;

        tracing::info!("Recorder stopped. Episodes: {}", episodes.len());
        Ok(episodes)
    }
}

impl Default for EpisodeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

struct RecordLoop {
    store: Box<dyn EpisodeStore>,
    tap: Arc<RecordTap>,
    state: Arc<RwLock<RecorderState>>,
    counters: Arc<RecorderCounters>,
    episode_index: usize,
    current: Option<EpisodeSummary>,
}

impl RecordLoop {
    fn new(
        store: Box<dyn EpisodeStore>,
        tap: Arc<RecordTap>,
        state: Arc<RwLock<RecorderState>>,
        counters: Arc<RecorderCounters>,
    ) -> Self {
        Self {
            store,
            tap,
            state,
            counters,
            episode_index: 0,
            current: None,
        }
    }

    fn run(mut self, cadence: Duration, running: Arc<AtomicBool>, shutdown: Shutdown) -> Vec<EpisodeSummary> {
        let mut finished = Vec::new();
        let mut next = Instant::now();

        while running.load(Ordering::SeqCst) && !shutdown.is_triggered() {
            if let Some(summary) = self.step() {
                finished.push(summary);
            }

            next += cadence;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                next = now;
            }
        }

        // Last sample, then close whatever is open
        if let Some(summary) = self.step() {
            finished.push(summary);
        }
        if let Some(summary) = self.finish_episode() {
            finished.push(summary);
        }
        *self.state.write() = RecorderState::Complete;
        finished
    }

    /// One cadence tick. Returns the summary when an episode was closed.
    fn step(&mut self) -> Option<EpisodeSummary> {
        // Read the flag first so a sample offered right before an end request
        // still lands in the closing episode
        let end = self.tap.end_requested.swap(false, Ordering::SeqCst);

        if let Some(sample) = self.tap.slot.take() {
            if let Err(e) = self.record(&sample) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to record sample {}: {}", sample.bundle.sequence, e);
            }
        }

        if end {
            self.finish_episode()
        } else {
            None
        }
    }

    fn record(&mut self, sample: &RecordSample) -> Result<(), StoreError> {
        if self.current.is_none() {
            self.store.begin_episode(self.episode_index)?;
            self.current = Some(EpisodeSummary::new(self.episode_index));
            *self.state.write() = RecorderState::Recording;
            tracing::info!("Episode {} started", self.episode_index);
        }

        let timestep_index = self.current.as_ref().map(|c| c.frames).unwrap_or(0);

        let mut images = BTreeMap::new();
        for (channel, data) in &sample.bundle.video {
            let image_ref = self.store.put_image(channel, timestep_index, data)?;
            images.insert(channel.clone(), image_ref);
        }

        let record = EpisodeRecord {
            episode_index: self.episode_index,
            timestep_index,
            timestamp: sample.bundle.capture_time,
            state: sample.state_vector(),
            action: sample.action_vector(),
            images,
        };
        self.store.append(&record)?;

        if let Some(current) = self.current.as_mut() {
            current.frames += 1;
        }
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish_episode(&mut self) -> Option<EpisodeSummary> {
        let mut summary = self.current.take()?;
        *self.state.write() = RecorderState::Waiting;

        if summary.frames == 0 {
            // The index is reused by the next episode
            if let Err(e) = self.store.abort_episode() {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to discard episode {}: {}", summary.episode_index, e);
            }
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Episode {} discarded: no records written", summary.episode_index);
            return None;
        }

        summary.end();
        if let Err(e) = self.store.finish_episode(&summary) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Failed to finish episode {}: {}", summary.episode_index, e);
        }

        self.episode_index += 1;
        self.counters.episodes.fetch_add(1, Ordering::Relaxed);
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaBundle;
    use crate::recorder::store::{read_episode, read_meta, DirectoryEpisodeStore};
    use crate::telemetry::{RelayTelemetry, TelemetryFrame};
    use tempfile::tempdir;

    fn sample(sequence: u64, x: f64) -> RecordSample {
        let frame = TelemetryFrame::new([x, 0.0, 0.2], [0.0; 3], 0.5, vec![], sequence as f64).unwrap();
        RecordSample {
            telemetry: RelayTelemetry::from_frame(&frame),
            bundle: MediaBundle::new(sequence, sequence as f64)
                .with_video("top", vec![0xffu8, 0xd8, sequence as u8]),
        }
    }

    /// Fails every append and remembers how episodes were closed
    #[derive(Default)]
    struct BrokenStore {
        calls: Arc<ParkingMutex<Vec<&'static str>>>,
    }

    impl EpisodeStore for BrokenStore {
        fn begin_episode(&mut self, _: usize) -> Result<(), StoreError> {
            self.calls.lock().push("begin");
            Ok(())
        }
        fn put_image(&mut self, _: &str, _: usize, _: &[u8]) -> Result<String, StoreError> {
            Ok(String::new())
        }
        fn append(&mut self, _: &EpisodeRecord) -> Result<(), StoreError> {
            Err(StoreError::InvalidDataset("disk full".to_string()))
        }
        fn finish_episode(&mut self, _: &EpisodeSummary) -> Result<(), StoreError> {
            self.calls.lock().push("finish");
            Ok(())
        }
        fn abort_episode(&mut self) -> Result<(), StoreError> {
            self.calls.lock().push("abort");
            Ok(())
        }
    }

    fn record_loop(store: Box<dyn EpisodeStore>, tap: Arc<RecordTap>) -> (RecordLoop, Arc<RecorderCounters>) {
        let counters = Arc::new(RecorderCounters::default());
        let record_loop = RecordLoop::new(
            store,
            tap,
            Arc::new(RwLock::new(RecorderState::Waiting)),
            counters.clone(),
        );
        (record_loop, counters)
    }

    #[test]
    fn test_latest_only_sampling() {
        let dir = tempdir().unwrap();
        let store = DirectoryEpisodeStore::open(dir.path(), "ds", 30, "").unwrap();
        let tap = Arc::new(RecordTap::new());
        let (mut record_loop, counters) = record_loop(Box::new(store), tap.clone());

        // Three ticks' worth of telemetry between two cadence steps
        tap.offer(sample(1, 0.1));
        tap.offer(sample(2, 0.2));
        tap.offer(sample(3, 0.3));
        record_loop.step();
        record_loop.step();

        tap.offer(sample(4, 0.4));
        tap.request_episode_end();
        let summary = record_loop.step().unwrap();
        assert_eq!(summary.frames, 2);

        let records = read_episode(&dir.path().join("ds"), 0).unwrap();
        let times: Vec<f64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![3.0, 4.0]);
        assert_eq!(records[1].action[0], 0.4);
        assert_eq!(counters.frames.load(Ordering::Relaxed), 2);
        assert_eq!(tap.superseded(), 2);
    }

    #[test]
    fn test_end_request_without_episode_is_ignored() {
        let dir = tempdir().unwrap();
        let store = DirectoryEpisodeStore::open(dir.path(), "ds", 30, "").unwrap();
        let tap = Arc::new(RecordTap::new());
        let (mut record_loop, _) = record_loop(Box::new(store), tap.clone());

        tap.request_episode_end();
        assert!(record_loop.step().is_none());

        tap.offer(sample(1, 0.1));
        record_loop.step();
        tap.request_episode_end();
        assert_eq!(record_loop.step().unwrap().episode_index, 0);

        tap.offer(sample(2, 0.1));
        record_loop.step();
        assert_eq!(record_loop.finish_episode().unwrap().episode_index, 1);
    }

    #[test]
    fn test_store_failures_are_counted_not_raised() {
        let tap = Arc::new(RecordTap::new());
        let (mut record_loop, counters) = record_loop(Box::new(BrokenStore::default()), tap.clone());

        tap.offer(sample(1, 0.1));
        record_loop.step();
        tap.offer(sample(2, 0.1));
        record_loop.step();

        assert_eq!(counters.failures.load(Ordering::Relaxed), 2);
        assert_eq!(counters.frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_episode_without_records_is_discarded() {
        let tap = Arc::new(RecordTap::new());
        let store = BrokenStore::default();
        let calls = store.calls.clone();
        let (mut record_loop, counters) = record_loop(Box::new(store), tap.clone());

        tap.offer(sample(1, 0.1));
        tap.request_episode_end();
        assert!(record_loop.step().is_none());
        assert_eq!(*record_loop.state.read(), RecorderState::Waiting);

        // Stop path: nothing saved either
        tap.offer(sample(2, 0.1));
        record_loop.step();
        assert!(record_loop.finish_episode().is_none());

        assert_eq!(*calls.lock(), vec!["begin", "abort", "begin", "abort"]);
        assert_eq!(counters.episodes.load(Ordering::Relaxed), 0);
        assert_eq!(counters.discarded.load(Ordering::Relaxed), 2);
        assert_eq!(record_loop.episode_index, 0);
    }

    #[test]
    fn test_threaded_recorder_finalizes_on_stop() {
        let dir = tempdir().unwrap();
        let store = DirectoryEpisodeStore::open(dir.path(), "ds", 100, "").unwrap();
        let recorder = EpisodeRecorder::new();
        let tap = recorder.tap();

        recorder
            .start(Box::new(store), Duration::from_millis(5), Shutdown::new())
            .unwrap();
        assert!(matches!(
            recorder.start(Box::new(BrokenStore::default()), Duration::from_millis(5), Shutdown::new()),
            Err(RecorderError::AlreadyRunning)
        ));

        for sequence in 1..=3 {
            tap.offer(sample(sequence, 0.1));
            let deadline = Instant::now() + Duration::from_secs(2);
            while recorder.stats().frames < sequence && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(recorder.state(), RecorderState::Recording);

        let episodes = recorder.stop().unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].frames, 3);
        assert_eq!(recorder.state(), RecorderState::Complete);

        let meta = read_meta(&dir.path().join("ds")).unwrap();
        assert_eq!(meta.episodes.len(), 1);
        assert_eq!(meta.state_dim, Some(1));
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRunning)));
    }
}
