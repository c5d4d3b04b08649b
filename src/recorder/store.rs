//! Episode store
//!
//! Write contract for recorded episodes, plus a directory-backed dataset.
//! A dataset is a directory containing:
//! - meta.json: format, fps, dimensions and finished episodes
//! - episodes/episode_NNNNNN.jsonl: one `EpisodeRecord` per line
//! - images/episode_NNNNNN/<KK>_<channel>/frame_NNNNNN.jpg: encoded images,
//!   where KK is the channel's position in `meta.json`

use super::state::{DatasetMeta, EpisodeRecord, EpisodeSummary};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Store-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("Missing required file: {0}")]
    MissingFile(String),

    #[error("No episode in progress")]
    NoEpisode,
}

/// Append-only episodic storage
pub trait EpisodeStore: Send {
    /// Open a new episode
    fn begin_episode(&mut self, episode_index: usize) -> Result<(), StoreError>;

    /// Persist one encoded image; returns the reference stored in records
    fn put_image(&mut self, channel: &str, timestep_index: usize, data: &[u8]) -> Result<String, StoreError>;

    /// Append one record to the open episode
    fn append(&mut self, record: &EpisodeRecord) -> Result<(), StoreError>;

    /// Close the open episode
    fn finish_episode(&mut self, summary: &EpisodeSummary) -> Result<(), StoreError>;

    /// Drop the open episode and anything written for it
    fn abort_episode(&mut self) -> Result<(), StoreError>;
}

const META_FILE: &str = "meta.json";
const EPISODES_DIR: &str = "episodes";
const IMAGES_DIR: &str = "images";

fn episode_name(episode_index: usize) -> String {
    format!("episode_{:06}", episode_index)
}

/// Readable form of a channel name for its directory
fn sanitize_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Directory for one channel. The index keeps channels apart even when
/// their sanitized names collide.
fn channel_dir(index: usize, channel: &str) -> String {
    format!("{:02}_{}", index, sanitize_channel(channel))
}

/// A repo id must stay below the data root: relative, plain names only
fn validate_repo_id(repo_id: &str) -> Result<(), StoreError> {
    let path = Path::new(repo_id);
    let plain = !repo_id.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidDataset(format!("bad repo id '{}'", repo_id)))
    }
}

struct OpenEpisode {
    index: usize,
    writer: BufWriter<File>,
}

/// Dataset directory on the local filesystem
pub struct DirectoryEpisodeStore {
    dataset_dir: PathBuf,
    meta: DatasetMeta,
    current: Option<OpenEpisode>,
}

impl DirectoryEpisodeStore {
    /// Create `root/repo_id`, replacing any existing dataset there
    pub fn open(root: &Path, repo_id: &str, fps: u32, instruction: &str) -> Result<Self, StoreError> {
        validate_repo_id(repo_id)?;

        let dataset_dir = root.join(repo_id);
        if dataset_dir.exists() {
            tracing::warn!("Replacing existing dataset at {:?}", dataset_dir);
            fs::remove_dir_all(&dataset_dir)?;
        }
        fs::create_dir_all(dataset_dir.join(EPISODES_DIR))?;
        fs::create_dir_all(dataset_dir.join(IMAGES_DIR))?;

        let store = Self {
            dataset_dir,
            meta: DatasetMeta::new(repo_id, fps, instruction),
            current: None,
        };
        store.write_meta()?;

        tracing::info!("Dataset opened at {:?}", store.dataset_dir);
        Ok(store)
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    fn write_meta(&self) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&self.meta)?;
        fs::write(self.dataset_dir.join(META_FILE), content)?;
        Ok(())
    }
}

impl EpisodeStore for DirectoryEpisodeStore {
    fn begin_episode(&mut self, episode_index: usize) -> Result<(), StoreError> {
        if let Some(open) = &self.current {
            return Err(StoreError::InvalidDataset(format!(
                "episode {} is still open",
                open.index
            )));
        }

        let path = self
            .dataset_dir
            .join(EPISODES_DIR)
            .join(format!("{}.jsonl", episode_name(episode_index)));
        let file = File::create(&path)?;
        self.current = Some(OpenEpisode {
            index: episode_index,
            writer: BufWriter::new(file),
        });

        tracing::debug!("Episode {} opened at {:?}", episode_index, path);
        Ok(())
    }

    fn put_image(&mut self, channel: &str, timestep_index: usize, data: &[u8]) -> Result<String, StoreError> {
        let episode = self.current.as_ref().ok_or(StoreError::NoEpisode)?.index;

        let channel_index = match self.meta.channels.iter().position(|c| c == channel) {
            Some(index) => index,
            None => {
                self.meta.channels.push(channel.to_string());
                self.meta.channels.len() - 1
            }
        };

        let relative = PathBuf::from(IMAGES_DIR)
            .join(episode_name(episode))
            .join(channel_dir(channel_index, channel))
            .join(format!("frame_{:06}.jpg", timestep_index));
        let path = self.dataset_dir.join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;

        Ok(relative.to_string_lossy().replace('\\', "/"))
    }

    fn append(&mut self, record: &EpisodeRecord) -> Result<(), StoreError> {
        let open = self.current.as_mut().ok_or(StoreError::NoEpisode)?;
        if record.episode_index != open.index {
            return Err(StoreError::InvalidDataset(format!(
                "record for episode {} appended to episode {}",
                record.episode_index, open.index
            )));
        }

        serde_json::to_writer(&mut open.writer, record)?;
        open.writer.write_all(b"\n")?;

        self.meta.state_dim.get_or_insert(record.state.len());
        self.meta.action_dim.get_or_insert(record.action.len());
        Ok(())
    }

    fn finish_episode(&mut self, summary: &EpisodeSummary) -> Result<(), StoreError> {
        let mut open = self.current.take().ok_or(StoreError::NoEpisode)?;
        open.writer.flush()?;
        open.writer.get_ref().sync_all()?;

        self.meta.episodes.push(summary.clone());
        self.write_meta()?;

        tracing::info!(
            "Episode {} saved: {} frames, {:.1}s",
            open.index,
            summary.frames,
            summary.duration_ms / 1000.0
        );
        Ok(())
    }

    fn abort_episode(&mut self) -> Result<(), StoreError> {
        let open = self.current.take().ok_or(StoreError::NoEpisode)?;
        let name = episode_name(open.index);
        drop(open.writer);

        let records = self.dataset_dir.join(EPISODES_DIR).join(format!("{}.jsonl", name));
        if records.exists() {
            fs::remove_file(&records)?;
        }
        let images = self.dataset_dir.join(IMAGES_DIR).join(&name);
        if images.exists() {
            fs::remove_dir_all(&images)?;
        }

        tracing::debug!("Episode {} discarded", open.index);
        Ok(())
    }
}

/// Read dataset metadata
pub fn read_meta(dataset_dir: &Path) -> Result<DatasetMeta, StoreError> {
    let meta_path = dataset_dir.join(META_FILE);
    if !meta_path.exists() {
        return Err(StoreError::MissingFile(META_FILE.to_string()));
    }
    let content = fs::read_to_string(&meta_path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Read every record of one episode
pub fn read_episode(dataset_dir: &Path, episode_index: usize) -> Result<Vec<EpisodeRecord>, StoreError> {
    let name = format!("{}.jsonl", episode_name(episode_index));
    let path = dataset_dir.join(EPISODES_DIR).join(&name);
    if !path.exists() {
        return Err(StoreError::MissingFile(name));
    }

    let reader = BufReader::new(File::open(&path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Check if a path looks like a dataset directory
pub fn is_valid_dataset(path: &Path) -> bool {
    path.is_dir() && path.join(META_FILE).exists() && path.join(EPISODES_DIR).is_dir()
}
