//! Queued point-to-point channels
//!
//! The sending handle buffers up to `queue_capacity` messages in process and
//! never blocks the caller. A background task owns the socket, reconnects
//! with the channel's retry policy and writes frames with a bounded timeout.
//! The receiving handle fans in any number of peers when it binds.

use super::framing::{read_frame, write_frame_timeout};
use super::{
    connect_stream, sleep_or_shutdown, ChannelCounters, ChannelStats, Endpoint, EndpointMode,
    MessageSink, TransportError,
};
use crate::config::ChannelConfig;
use crate::utils::Shutdown;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Pause before retrying a failed accept
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Why a connection loop stopped
#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Shutdown,
    QueueClosed,
    Broken,
}

// =============================================================================
// Sender
// =============================================================================

/// Sending end of a queued channel
pub struct QueuedSender {
    name: String,
    tx: mpsc::Sender<Bytes>,
    counters: Arc<ChannelCounters>,
    shutdown: Shutdown,
    local_addr: Option<SocketAddr>,
}

impl QueuedSender {
    /// Start the channel. Binding happens here so a taken port fails startup.
    pub async fn spawn(
        name: impl Into<String>,
        endpoint: Endpoint,
        config: ChannelConfig,
        shutdown: Shutdown,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(ChannelCounters::default());

        let task = SenderTask {
            name: name.clone(),
            config,
            counters: counters.clone(),
            shutdown: shutdown.clone(),
            rx,
        };

        let local_addr = match endpoint.mode {
            EndpointMode::Bind => {
                let listener = TcpListener::bind(&endpoint.address).await?;
                let local = listener.local_addr()?;
                tracing::info!("Channel {} bound to {}", name, local);
                tokio::spawn(task.run_bound(listener));
                Some(local)
            }
            EndpointMode::Connect => {
                tokio::spawn(task.run_connecting(endpoint.address));
                None
            }
        };

        Ok(Self {
            name,
            tx,
            counters,
            shutdown,
            local_addr,
        })
    }

    /// Whether a peer is currently attached
    pub fn is_connected(&self) -> bool {
        self.counters.peers.load(Ordering::Relaxed) > 0
    }

    /// Messages waiting in the local queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Bound address when this end binds
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

impl MessageSink for QueuedSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.shutdown.is_triggered() {
            return Err(TransportError::Closed(self.name.clone()));
        }
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                ChannelCounters::bump(&self.counters.dropped);
                Err(TransportError::QueueFull(self.name.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed(self.name.clone())),
        }
    }
}

struct SenderTask {
    name: String,
    config: ChannelConfig,
    counters: Arc<ChannelCounters>,
    shutdown: Shutdown,
    rx: mpsc::Receiver<Bytes>,
}

impl SenderTask {
    async fn run_connecting(mut self, address: String) {
        let mut backoff = self.config.retry.backoff();
        let mut ever_connected = false;
        let shutdown = self.shutdown.clone();

        loop {
            let connected = tokio::select! {
                _ = shutdown.triggered() => break,
                result = connect_stream(&address, self.config.connect_timeout()) => result,
            };

            match connected {
                Ok(stream) => {
                    if ever_connected {
                        ChannelCounters::bump(&self.counters.reconnects);
                    }
                    ever_connected = true;
                    backoff.reset();
                    tracing::info!("Channel {} connected to {}", self.name, address);

                    match self.pump(stream).await {
                        PumpEnd::Broken => {
                            tracing::warn!("Channel {} lost connection to {}", self.name, address);
                        }
                        PumpEnd::Shutdown | PumpEnd::QueueClosed => break,
                    }
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(
                            "Channel {} connect to {} failed: {} (retry in {:?})",
                            self.name,
                            address,
                            e,
                            delay
                        );
                        if !sleep_or_shutdown(delay, &shutdown).await {
                            break;
                        }
                    }
                    None => {
                        let err = TransportError::RetriesExhausted {
                            name: self.name.clone(),
                            attempts: backoff.attempts() - 1,
                        };
                        tracing::error!("{}", err);
                        break;
                    }
                },
            }
        }

        tracing::debug!("Channel {} sender stopped", self.name);
    }

    async fn run_bound(mut self, listener: TcpListener) {
        let shutdown = self.shutdown.clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.triggered() => break,
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Channel {} could not set nodelay: {}", self.name, e);
                    }
                    tracing::info!("Channel {} accepted {}", self.name, peer);
                    match self.pump(stream).await {
                        PumpEnd::Broken => {
                            tracing::warn!("Channel {} lost peer {}", self.name, peer);
                            ChannelCounters::bump(&self.counters.reconnects);
                        }
                        PumpEnd::Shutdown | PumpEnd::QueueClosed => break,
                    }
                }
                Err(e) => {
                    tracing::warn!("Channel {} accept failed: {}", self.name, e);
                    if !sleep_or_shutdown(ACCEPT_RETRY, &shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Channel {} sender stopped", self.name);
    }

    /// Drain the queue into one connection until it breaks
    async fn pump(&mut self, mut stream: TcpStream) -> PumpEnd {
        let shutdown = self.shutdown.clone();
        let limit = self.config.max_frame_bytes;
        let timeout = self.config.send_timeout();
        self.counters.peers.fetch_add(1, Ordering::Relaxed);

        let end = loop {
            let payload = tokio::select! {
                _ = shutdown.triggered() => break PumpEnd::Shutdown,
                message = self.rx.recv() => match message {
                    Some(payload) => payload,
                    None => break PumpEnd::QueueClosed,
                },
            };

            match write_frame_timeout(&mut stream, &payload, limit, timeout).await {
                Ok(()) => ChannelCounters::bump(&self.counters.sent),
                Err(e @ TransportError::FrameTooLarge { .. }) => {
                    ChannelCounters::bump(&self.counters.dropped);
                    tracing::warn!("Channel {} dropped frame: {}", self.name, e);
                }
                Err(e) => {
                    ChannelCounters::bump(&self.counters.dropped);
                    tracing::warn!("Channel {} send failed: {}", self.name, e);
                    break PumpEnd::Broken;
                }
            }
        };

        self.counters.peers.fetch_sub(1, Ordering::Relaxed);
        end
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Receiving end of a queued channel
pub struct QueuedReceiver {
    name: String,
    rx: mpsc::Receiver<Bytes>,
    counters: Arc<ChannelCounters>,
    shutdown: Shutdown,
    local_addr: Option<SocketAddr>,
}

impl QueuedReceiver {
    /// Start the channel. Binding happens here so a taken port fails startup.
    pub async fn spawn(
        name: impl Into<String>,
        endpoint: Endpoint,
        config: ChannelConfig,
        shutdown: Shutdown,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(ChannelCounters::default());

        let local_addr = match endpoint.mode {
            EndpointMode::Bind => {
                let listener = TcpListener::bind(&endpoint.address).await?;
                let local = listener.local_addr()?;
                tracing::info!("Channel {} bound to {}", name, local);
                tokio::spawn(accept_peers(
                    name.clone(),
                    listener,
                    tx,
                    counters.clone(),
                    config,
                    shutdown.clone(),
                ));
                Some(local)
            }
            EndpointMode::Connect => {
                tokio::spawn(connect_peer(
                    name.clone(),
                    endpoint.address,
                    tx,
                    counters.clone(),
                    config,
                    shutdown.clone(),
                ));
                None
            }
        };

        Ok(Self {
            name,
            rx,
            counters,
            shutdown,
            local_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message, or `None` once shutdown fires or the channel task ends
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            _ = self.shutdown.triggered() => None,
            message = self.rx.recv() => message,
        }
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.counters.peers.load(Ordering::Relaxed) > 0
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

async fn accept_peers(
    name: String,
    listener: TcpListener,
    tx: mpsc::Sender<Bytes>,
    counters: Arc<ChannelCounters>,
    config: ChannelConfig,
    shutdown: Shutdown,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.triggered() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::info!("Channel {} accepted {}", name, peer);
                let name = name.clone();
                let tx = tx.clone();
                let counters = counters.clone();
                let shutdown = shutdown.clone();
                let limit = config.max_frame_bytes;
                tokio::spawn(async move {
                    let end = read_peer(&name, stream, &tx, &counters, &shutdown, limit).await;
                    if end == PumpEnd::Broken {
                        tracing::info!("Channel {} peer {} disconnected", name, peer);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Channel {} accept failed: {}", name, e);
                if !sleep_or_shutdown(ACCEPT_RETRY, &shutdown).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("Channel {} receiver stopped", name);
}

async fn connect_peer(
    name: String,
    address: String,
    tx: mpsc::Sender<Bytes>,
    counters: Arc<ChannelCounters>,
    config: ChannelConfig,
    shutdown: Shutdown,
) {
    let mut backoff = config.retry.backoff();
    let mut ever_connected = false;

    loop {
        let connected = tokio::select! {
            _ = shutdown.triggered() => break,
            result = connect_stream(&address, config.connect_timeout()) => result,
        };

        match connected {
            Ok(stream) => {
                if ever_connected {
                    ChannelCounters::bump(&counters.reconnects);
                }
                ever_connected = true;
                backoff.reset();
                tracing::info!("Channel {} connected to {}", name, address);

                let end = read_peer(&name, stream, &tx, &counters, &shutdown, config.max_frame_bytes).await;
                if end != PumpEnd::Broken {
                    break;
                }
                tracing::warn!("Channel {} lost connection to {}", name, address);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        "Channel {} connect to {} failed: {} (retry in {:?})",
                        name,
                        address,
                        e,
                        delay
                    );
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                }
                None => {
                    tracing::error!("Channel {} giving up on {}", name, address);
                    break;
                }
            },
        }
    }
    tracing::debug!("Channel {} receiver stopped", name);
}

/// Forward frames from one connection into the local queue
async fn read_peer(
    name: &str,
    mut stream: TcpStream,
    tx: &mpsc::Sender<Bytes>,
    counters: &ChannelCounters,
    shutdown: &Shutdown,
    limit: usize,
) -> PumpEnd {
    counters.peers.fetch_add(1, Ordering::Relaxed);

    let end = loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => break PumpEnd::Shutdown,
            result = read_frame(&mut stream, limit) => result,
        };

        match frame {
            Ok(Some(payload)) => {
                ChannelCounters::bump(&counters.received);
                tokio::select! {
                    _ = shutdown.triggered() => break PumpEnd::Shutdown,
                    result = tx.send(payload) => {
                        if result.is_err() {
                            break PumpEnd::QueueClosed;
                        }
                    }
                }
            }
            Ok(None) => break PumpEnd::Broken,
            Err(e) => {
                tracing::warn!("Channel {} read failed: {}", name, e);
                break PumpEnd::Broken;
            }
        }
    };

    counters.peers.fetch_sub(1, Ordering::Relaxed);
    end
}
