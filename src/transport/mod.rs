//! Message transport
//!
//! Length-prefixed TCP frames carrying two kinds of channel: queued
//! point-to-point channels with sender-side buffering, and broadcast channels
//! that only deliver to currently connected subscribers. Reconnects are an
//! explicit retry policy with a visible connected flag.

pub mod broadcast;
pub mod endpoint;
pub mod framing;
pub mod memory;
pub mod queued;
pub mod retry;

pub use broadcast::{BroadcastPublisher, BroadcastSubscriber};
pub use endpoint::{Endpoint, EndpointMode};
pub use memory::MemorySink;
pub use queued::{QueuedReceiver, QueuedSender};
pub use retry::{Backoff, RetryPolicy};

use crate::utils::Shutdown;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue full on channel {0}")]
    QueueFull(String),

    #[error("Channel {0} is closed")]
    Closed(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Gave up on {name} after {attempts} attempts")]
    RetriesExhausted { name: String, attempts: u32 },
}

/// Non-blocking outbound message seam
///
/// Producers of wire messages only talk to this trait so one failing or slow
/// destination cannot hold up another.
pub trait MessageSink: Send + Sync {
    /// Channel name used in logs and counters
    fn name(&self) -> &str;

    /// Hand one encoded message to the channel without blocking
    fn try_send(&self, payload: Bytes) -> Result<(), TransportError>;
}

/// Counters exposed by every channel handle
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub reconnects: u64,
    pub peers: usize,
    pub connected: bool,
}

/// Shared between a channel handle and its socket task
#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub peers: AtomicUsize,
}

impl ChannelCounters {
    pub fn snapshot(&self) -> ChannelStats {
        let peers = self.peers.load(Ordering::Relaxed);
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            peers,
            connected: peers > 0,
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Open a TCP connection with an upper bound on the handshake
pub(crate) async fn connect_stream(
    address: &str,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(result) => result?,
        Err(_) => return Err(TransportError::Timeout(timeout)),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sleep unless shutdown fires first. Returns false on shutdown.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.triggered() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
