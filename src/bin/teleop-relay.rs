//! Relay node
//!
//! Forwards producer telemetry to the execution node, broadcasts execution
//! media back to the producer and records paired episodes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teleop_bridge::config::{load_config, RelayConfig};
use teleop_bridge::recorder::{DirectoryEpisodeStore, EpisodeRecorder};
use teleop_bridge::relay::Relay;
use teleop_bridge::transport::{BroadcastPublisher, Endpoint, QueuedReceiver, QueuedSender};
use teleop_bridge::utils::Shutdown;

/// Teleop relay - command bridge, media broadcast and episode recorder
#[derive(Parser, Debug)]
#[command(name = "teleop-relay", version)]
#[command(about = "Bridge producer telemetry to the execution node and record episodes", long_about = None)]
struct Args {
    /// JSON configuration file; flags override it
    #[arg(long, env = "TELEOP_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Telemetry from the producer, e.g. bind://0.0.0.0:5555
    #[arg(long)]
    command_in: Option<Endpoint>,

    /// Commands to the execution node, e.g. bind://0.0.0.0:5556
    #[arg(long)]
    command_out: Option<Endpoint>,

    /// Media bundles from the execution node, e.g. bind://0.0.0.0:5558
    #[arg(long)]
    media_in: Option<Endpoint>,

    /// Bind address of the media broadcast to the producer
    #[arg(long)]
    media_out: Option<String>,

    /// Disable episode recording
    #[arg(long)]
    no_record: bool,

    /// Directory holding datasets
    #[arg(long, env = "TELEOP_DATA_ROOT")]
    data_root: Option<PathBuf>,

    /// Dataset name under the data root
    #[arg(long)]
    repo_id: Option<String>,

    /// Recording cadence in frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Task instruction stored with the dataset
    #[arg(long)]
    instruction: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig> {
        let mut config: RelayConfig = match &self.config {
            Some(path) => load_config::<RelayConfig>(path).with_context(|| format!("Failed to load {:?}", path))?,
            None => RelayConfig::default(),
        };

        if let Some(endpoint) = self.command_in {
            config.command_in = endpoint;
        }
        if let Some(endpoint) = self.command_out {
            config.command_out = endpoint;
        }
        if let Some(endpoint) = self.media_in {
            config.media_in = endpoint;
        }
        if let Some(address) = self.media_out {
            config.media_out = address;
        }
        if self.no_record {
            config.recorder.enabled = false;
        }
        if let Some(root) = self.data_root {
            config.recorder.data_root = root;
        }
        if let Some(repo_id) = self.repo_id {
            config.recorder.repo_id = repo_id;
        }
        if let Some(fps) = self.fps {
            config.recorder.fps = fps;
        }
        if let Some(instruction) = self.instruction {
            config.recorder.instruction = instruction;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    teleop_bridge::init_tracing();
    let config = Args::parse().into_config()?;

    tracing::info!("Starting teleop relay v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down");
        }
        signal.trigger();
    });

    let execution = Arc::new(
        QueuedSender::spawn("execution", config.command_out.clone(), config.channel.clone(), shutdown.clone())
            .await
            .with_context(|| format!("Failed to open {}", config.command_out))?,
    );
    let broadcast = Arc::new(
        BroadcastPublisher::spawn(
            "media-out",
            &config.media_out,
            config.broadcast_capacity,
            config.channel.clone(),
            shutdown.clone(),
        )
        .await
        .with_context(|| format!("Failed to bind media broadcast on {}", config.media_out))?,
    );
    let commands = QueuedReceiver::spawn("commands", config.command_in.clone(), config.channel.clone(), shutdown.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.command_in))?;
    let media = QueuedReceiver::spawn("media-in", config.media_in.clone(), config.channel.clone(), shutdown.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.media_in))?;

    let mut relay = Relay::new(
        execution.clone(),
        broadcast.clone(),
        config.recorder.max_pair_skew_secs,
    );

    let recorder = if config.recorder.enabled {
        let rc = &config.recorder;
        let store = DirectoryEpisodeStore::open(&rc.data_root, &rc.repo_id, rc.fps, &rc.instruction)
            .with_context(|| format!("Failed to open dataset {:?}", rc.dataset_dir()))?;
        let recorder = EpisodeRecorder::new();
        recorder.start(Box::new(store), rc.cadence(), shutdown.clone())?;
        relay = relay.with_recorder_tap(recorder.tap());
        Some(recorder)
    } else {
        tracing::info!("Episode recording disabled");
        None
    };

    let relay = Arc::new(relay);
    let status_interval = Duration::from_secs_f64(config.status_interval_secs);
    let tasks = vec![
        tokio::spawn(relay.clone().run_commands(commands)),
        tokio::spawn(relay.clone().run_media(media)),
        tokio::spawn(relay.clone().run_status(status_interval, shutdown.clone())),
    ];

    shutdown.triggered().await;
    for task in tasks {
        let _ = task.await;
    }

    if let Some(recorder) = recorder {
        let (episodes, recorder_stats) = tokio::task::spawn_blocking(move || {
            let episodes = recorder.stop();
            (episodes, recorder.stats())
        })
        .await?;
        let episodes = episodes?;
        tracing::info!(
            "Recorded {} episodes this run ({} frames, {} failures)",
            episodes.len(),
            recorder_stats.frames,
            recorder_stats.failures
        );
    }

    let execution_stats = execution.stats();
    let broadcast_stats = broadcast.stats();
    tracing::info!(
        "Relay stopped. Execution: sent {}, dropped {} | broadcast: published {}, undelivered {}",
        execution_stats.sent,
        execution_stats.dropped,
        broadcast_stats.published,
        broadcast_stats.undelivered
    );
    Ok(())
}
