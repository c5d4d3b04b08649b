//! Producer node
//!
//! Turns IMU samples into pose telemetry for the relay and the simulation,
//! and consumes the media the relay broadcasts back.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teleop_bridge::audio::{JitterBuffer, NullSink, PlaybackClock};
use teleop_bridge::config::{load_config, ProducerConfig};
use teleop_bridge::media::{Demultiplexer, FrameBoard};
use teleop_bridge::producer::{
    run_sensor, JsonLinesSensor, MediaReceiver, SensorHub, SensorSource, SimulatedSensor, StatusPublisher,
    TwoLinkArm,
};
use teleop_bridge::telemetry::{Diagnostics, DualPublisher, FrameSource};
use teleop_bridge::transport::{BroadcastPublisher, BroadcastSubscriber, Endpoint, MessageSink, QueuedSender};
use teleop_bridge::utils::Shutdown;
use tokio::io::BufReader;

/// Teleop producer - IMU telemetry publisher and media consumer
#[derive(Parser, Debug)]
#[command(name = "teleop-producer", version)]
#[command(about = "Publish IMU pose telemetry and receive relay media", long_about = None)]
struct Args {
    /// JSON configuration file; flags override it
    #[arg(long, env = "TELEOP_PRODUCER_CONFIG")]
    config: Option<PathBuf>,

    /// Relay leg, e.g. connect://relay-host:5555
    #[arg(long)]
    relay: Option<Endpoint>,

    /// Simulation leg, e.g. connect://localhost:5559
    #[arg(long, conflicts_with = "no_simulation")]
    simulation: Option<Endpoint>,

    /// Do not publish to the simulation
    #[arg(long)]
    no_simulation: bool,

    /// Relay media broadcast address, e.g. relay-host:5557
    #[arg(long)]
    media: Option<String>,

    /// Ignore video from the relay
    #[arg(long)]
    no_video: bool,

    /// Ignore audio from the relay
    #[arg(long)]
    no_audio: bool,

    /// Publish tick interval in milliseconds
    #[arg(long)]
    publish_interval_ms: Option<u64>,

    /// Seconds without a report before a source is offline
    #[arg(long)]
    liveness_timeout: Option<f64>,

    /// Publish even while sources are offline
    #[arg(long)]
    no_strict_gating: bool,

    /// Jitter buffer capacity in segments
    #[arg(long)]
    jitter_capacity: Option<usize>,

    /// Segments buffered before playback starts
    #[arg(long)]
    jitter_min_fill: Option<usize>,

    /// Bind address for JSON status snapshots
    #[arg(long)]
    diagnostics: Option<String>,

    /// Disable status snapshots
    #[arg(long, conflicts_with = "diagnostics")]
    no_diagnostics: bool,

    /// Drive the sensors from the built-in simulator instead of stdin.
    /// Without it, stdin takes one JSON sample per line plus gripper
    /// commands: `1` opens a step, `2` closes a step, `{"gripper":0.4}` sets it.
    #[arg(long)]
    simulate_sensors: bool,
}

impl Args {
    fn into_config(self) -> Result<ProducerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                load_config::<ProducerConfig>(path).with_context(|| format!("Failed to load {:?}", path))?
            }
            None => ProducerConfig::default(),
        };

        if let Some(endpoint) = self.relay {
            config.relay = endpoint;
        }
        if self.no_simulation {
            config.simulation = None;
        } else if let Some(endpoint) = self.simulation {
            config.simulation = Some(endpoint);
        }
        if let Some(address) = self.media {
            config.media = Some(address);
        }
        if self.no_video {
            config.video_enabled = false;
        }
        if self.no_audio {
            config.audio_enabled = false;
        }
        if let Some(interval) = self.publish_interval_ms {
            config.publish_interval_ms = interval;
        }
        if let Some(timeout) = self.liveness_timeout {
            config.liveness.timeout_secs = timeout;
        }
        if self.no_strict_gating {
            config.liveness.strict_gating = false;
        }
        if let Some(capacity) = self.jitter_capacity {
            config.jitter.capacity = capacity;
        }
        if let Some(min_fill) = self.jitter_min_fill {
            config.jitter.min_fill = min_fill;
        }
        if self.simulate_sensors {
            config.simulate_sensors = true;
        }
        if self.no_diagnostics {
            config.diagnostics = None;
        } else if let Some(address) = self.diagnostics {
            config.diagnostics = Some(address);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Audio output for the jitter buffer
enum Playback {
    Clock(PlaybackClock),
    #[cfg(feature = "playback")]
    Device(teleop_bridge::audio::CpalPlayback),
}

impl Playback {
    fn start(jitter: Arc<JitterBuffer>, config: &ProducerConfig, shutdown: &Shutdown) -> Self {
        #[cfg(feature = "playback")]
        {
            match teleop_bridge::audio::CpalPlayback::start(
                jitter.clone(),
                config.jitter.sample_rate,
                config.jitter.channels,
            ) {
                Ok(device) => return Playback::Device(device),
                Err(e) => tracing::warn!("Falling back to silent playback: {}", e),
            }
        }
        #[cfg(not(feature = "playback"))]
        tracing::info!(
            "Built without the playback feature; {}Hz audio is drained silently",
            config.jitter.sample_rate
        );

        Playback::Clock(PlaybackClock::start(jitter, Box::new(NullSink::new()), shutdown.clone()))
    }

    fn stop(&self) {
        match self {
            Playback::Clock(clock) => clock.stop(),
            #[cfg(feature = "playback")]
            Playback::Device(device) => device.stop(),
        }
    }
}

fn main() -> Result<()> {
    teleop_bridge::init_tracing();
    let config = Args::parse().into_config()?;

    // A pending stdin read would otherwise hold the runtime open on exit
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(config: ProducerConfig) -> Result<()> {
    tracing::info!("Starting teleop producer v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down");
        }
        signal.trigger();
    });

    // Outbound legs
    let relay = Arc::new(
        QueuedSender::spawn("relay", config.relay.clone(), config.channel.clone(), shutdown.clone())
            .await
            .with_context(|| format!("Failed to open {}", config.relay))?,
    );
    let simulation = match &config.simulation {
        Some(endpoint) => Some(Arc::new(
            QueuedSender::spawn("simulation", endpoint.clone(), config.channel.clone(), shutdown.clone())
                .await
                .with_context(|| format!("Failed to open {}", endpoint))?,
        )),
        None => {
            tracing::info!("Simulation leg disabled");
            None
        }
    };

    // Sensors
    let hub = Arc::new(SensorHub::new(
        &config.liveness,
        config.yaw_mode,
        Box::new(TwoLinkArm::new(config.arm.clone())),
    ));
    let sensor: Box<dyn SensorSource> = if config.simulate_sensors {
        Box::new(SimulatedSensor::new(config.liveness.sources.clone(), config.publish_interval()))
    } else {
        tracing::info!("Reading sensor samples and gripper commands from stdin");
        Box::new(JsonLinesSensor::new("stdin", BufReader::new(tokio::io::stdin())))
    };

    let mut tasks = vec![tokio::spawn(run_sensor(sensor, hub.clone(), shutdown.clone()))];

    // Publish loop
    let diagnostics = Arc::new(Diagnostics::new());
    let publisher = Arc::new(DualPublisher::new(
        relay.clone(),
        simulation.clone().map(|s| s as Arc<dyn MessageSink>),
        config.liveness.strict_gating,
        diagnostics.clone(),
    ));
    tasks.push(tokio::spawn(publisher.clone().run(
        hub.clone() as Arc<dyn FrameSource>,
        config.publish_interval(),
        Duration::from_secs_f64(config.status_interval_secs),
        shutdown.clone(),
    )));

    // Media back from the relay
    let mut playback = None;
    let mut status_jitter = None;
    match &config.media {
        Some(address) if config.video_enabled || config.audio_enabled => {
            let board = Arc::new(FrameBoard::new());
            let jitter = config
                .audio_enabled
                .then(|| Arc::new(JitterBuffer::new(&config.jitter)));
            status_jitter = jitter.clone();

            let mut demux = Demultiplexer::new(
                board,
                jitter.clone(),
                config.jitter.sample_rate,
                config.jitter.channels,
            );
            if !config.video_enabled {
                demux = demux.without_video();
            }
            if let Some(jitter) = jitter {
                playback = Some(Playback::start(jitter, &config, &shutdown));
            }

            let subscriber = BroadcastSubscriber::spawn("media", address.clone(), config.channel.clone(), shutdown.clone());
            tasks.push(tokio::spawn(MediaReceiver::new(demux, diagnostics.clone()).run(subscriber)));
        }
        _ => tracing::info!("Media receive disabled"),
    }

    // Status snapshots for dashboards
    match &config.diagnostics {
        Some(address) => {
            let channel = Arc::new(
                BroadcastPublisher::spawn("status", address, 16, config.channel.clone(), shutdown.clone())
                    .await
                    .with_context(|| format!("Failed to bind status channel on {}", address))?,
            );
            let status = Arc::new(
                StatusPublisher::new(hub.clone(), publisher.clone(), &config.arm, channel)
                    .with_jitter(status_jitter),
            );
            tasks.push(tokio::spawn(status.run(config.diagnostics_interval(), shutdown.clone())));
        }
        None => tracing::info!("Status snapshots disabled"),
    }

    shutdown.triggered().await;
    for task in tasks {
        let _ = task.await;
    }
    if let Some(playback) = playback {
        tokio::task::spawn_blocking(move || playback.stop()).await?;
    }

    let stats = publisher.stats();
    tracing::info!(
        "Producer stopped. Published {}, skipped {}, relay failures {}, simulation failures {}",
        stats.published,
        stats.skipped,
        stats.relay_failures,
        stats.simulation_failures
    );
    Ok(())
}
