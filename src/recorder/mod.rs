//! Episode recording
//!
//! Samples the relay's paired telemetry and media at a fixed cadence and
//! writes episodes to a dataset store:
//! - EpisodeStore trait and the directory-backed dataset
//! - EpisodeRecorder thread fed through a RecordTap
//! - Recorder state and record types

pub mod coordinator;
pub mod state;
pub mod store;

pub use coordinator::{EpisodeRecorder, RecordTap, RecorderError, RecorderStats};
pub use state::{DatasetMeta, EpisodeRecord, EpisodeSummary, RecordSample, RecorderState};
pub use store::{is_valid_dataset, read_episode, read_meta, DirectoryEpisodeStore, EpisodeStore, StoreError};
