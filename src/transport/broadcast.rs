//! Broadcast channels
//!
//! The publisher binds and streams every frame to whoever is connected at
//! that moment. Nothing is kept for absent subscribers; a subscriber that
//! falls behind loses its oldest frames.

use super::framing::{read_frame, write_frame_timeout};
use super::{
    connect_stream, sleep_or_shutdown, ChannelCounters, ChannelStats, MessageSink, TransportError,
};
use crate::config::ChannelConfig;
use crate::utils::Shutdown;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Publisher counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub published: u64,
    /// Frames published while nobody was subscribed
    pub undelivered: u64,
    /// Frames skipped by slow subscribers
    pub lagged: u64,
    /// Per-subscriber writes skipped for exceeding the frame limit
    pub oversized: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct PublisherCounters {
    published: AtomicU64,
    undelivered: AtomicU64,
    lagged: AtomicU64,
    oversized: AtomicU64,
}

/// Publishing end of a broadcast channel
pub struct BroadcastPublisher {
    name: String,
    tx: broadcast::Sender<Bytes>,
    counters: Arc<PublisherCounters>,
    shutdown: Shutdown,
    local_addr: SocketAddr,
}

impl BroadcastPublisher {
    /// Bind and start accepting subscribers. `capacity` is the per-subscriber
    /// backlog before the oldest frames are skipped; `config` bounds frame
    /// size and write time for every subscriber.
    pub async fn spawn(
        name: impl Into<String>,
        bind_address: &str,
        capacity: usize,
        config: ChannelConfig,
        shutdown: Shutdown,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(capacity.max(1));
        let counters = Arc::new(PublisherCounters::default());

        tracing::info!("Broadcast {} bound to {}", name, local_addr);
        tokio::spawn(accept_subscribers(
            name.clone(),
            listener,
            tx.clone(),
            counters.clone(),
            config,
            shutdown.clone(),
        ));

        Ok(Self {
            name,
            tx,
            counters,
            shutdown,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribers attached right now
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.counters.published.load(Ordering::Relaxed),
            undelivered: self.counters.undelivered.load(Ordering::Relaxed),
            lagged: self.counters.lagged.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl MessageSink for BroadcastPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget. No subscriber is not an error.
    fn try_send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.shutdown.is_triggered() {
            return Err(TransportError::Closed(self.name.clone()));
        }
        match self.tx.send(payload) {
            Ok(_) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.undelivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Broadcast {} has no subscribers", self.name);
            }
        }
        Ok(())
    }
}

async fn accept_subscribers(
    name: String,
    listener: TcpListener,
    tx: broadcast::Sender<Bytes>,
    counters: Arc<PublisherCounters>,
    limits: ChannelConfig,
    shutdown: Shutdown,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.triggered() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::info!("Broadcast {} subscriber {} joined", name, peer);
                let rx = tx.subscribe();
                let name = name.clone();
                let counters = counters.clone();
                let shutdown = shutdown.clone();
                let limits = limits.clone();
                tokio::spawn(async move {
                    serve_subscriber(&name, stream, rx, &counters, &shutdown, &limits).await;
                    tracing::info!("Broadcast {} subscriber {} left", name, peer);
                });
            }
            Err(e) => {
                tracing::warn!("Broadcast {} accept failed: {}", name, e);
                if !sleep_or_shutdown(Duration::from_millis(100), &shutdown).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("Broadcast {} stopped", name);
}

async fn serve_subscriber(
    name: &str,
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<Bytes>,
    counters: &PublisherCounters,
    shutdown: &Shutdown,
    limits: &ChannelConfig,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Broadcast {} could not set nodelay: {}", name, e);
    }

    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => return,
            result = rx.recv() => result,
        };

        match frame {
            Ok(payload) => {
                match write_frame_timeout(&mut stream, &payload, limits.max_frame_bytes, limits.send_timeout()).await {
                    Ok(()) => {}
                    // Rejected before any byte is written, so the stream is intact
                    Err(e @ TransportError::FrameTooLarge { .. }) => {
                        counters.oversized.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Broadcast {} skipped frame: {}", name, e);
                    }
                    Err(e) => {
                        tracing::debug!("Broadcast {} write failed: {}", name, e);
                        return;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                counters.lagged.fetch_add(skipped, Ordering::Relaxed);
                tracing::warn!("Broadcast {} subscriber lagged, skipped {} frames", name, skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Receiving end of a broadcast channel
pub struct BroadcastSubscriber {
    name: String,
    rx: mpsc::Receiver<Bytes>,
    counters: Arc<ChannelCounters>,
    shutdown: Shutdown,
}

impl BroadcastSubscriber {
    /// Start a reconnecting reader for `address`
    pub fn spawn(
        name: impl Into<String>,
        address: impl Into<String>,
        config: ChannelConfig,
        shutdown: Shutdown,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(ChannelCounters::default());

        tokio::spawn(subscribe_loop(
            name.clone(),
            address.into(),
            tx,
            counters.clone(),
            config,
            shutdown.clone(),
        ));

        Self {
            name,
            rx,
            counters,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next frame, or `None` once shutdown fires
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            _ = self.shutdown.triggered() => None,
            message = self.rx.recv() => message,
        }
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.counters.peers.load(Ordering::Relaxed) > 0
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

async fn subscribe_loop(
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

        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        "Subscriber {} connect to {} failed: {} (retry in {:?})",
                        name,
                        address,
                        e,
                        delay
                    );
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
                None => {
                    tracing::error!("Subscriber {} giving up on {}", name, address);
                    break;
                }
            },
        };

        if ever_connected {
            ChannelCounters::bump(&counters.reconnects);
        }
        ever_connected = true;
        backoff.reset();
        counters.peers.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Subscriber {} connected to {}", name, address);

        let stop = loop {
            let frame = tokio::select! {
                _ = shutdown.triggered() => break true,
                result = read_frame(&mut stream, config.max_frame_bytes) => result,
            };

            match frame {
                Ok(Some(payload)) => {
                    ChannelCounters::bump(&counters.received);
                    match tx.try_send(payload) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            ChannelCounters::bump(&counters.dropped);
                            tracing::trace!("Subscriber {} queue full, dropped frame", name);
                        }
                        Err(TrySendError::Closed(_)) => break true,
                    }
                }
                Ok(None) => break false,
                Err(e) => {
                    tracing::warn!("Subscriber {} read failed: {}", name, e);
                    break false;
                }
            }
        };

        counters.peers.fetch_sub(1, Ordering::Relaxed);
        if stop {
            break;
        }
        tracing::warn!("Subscriber {} lost connection to {}", name, address);
    }
    tracing::debug!("Subscriber {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should become true");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let shutdown = Shutdown::new();
        let publisher = BroadcastPublisher::spawn("media", "127.0.0.1:0", 4, ChannelConfig::default(), shutdown.clone())
            .await
            .unwrap();

        publisher.try_send(Bytes::from_static(b"nobody")).unwrap();
        let stats = publisher.stats();
        assert_eq!(stats.undelivered, 1);
        assert_eq!(stats.published, 0);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_subscriber_receives_after_joining() {
        let shutdown = Shutdown::new();
        let publisher = BroadcastPublisher::spawn("media", "127.0.0.1:0", 4, ChannelConfig::default(), shutdown.clone())
            .await
            .unwrap();
        let mut subscriber = BroadcastSubscriber::spawn(
            "viewer",
            publisher.local_addr().to_string(),
            ChannelConfig::default(),
            shutdown.clone(),
        );

        wait_for(|| publisher.subscriber_count() == 1).await;
        publisher.try_send(Bytes::from_static(b"frame")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"frame"));
        assert!(subscriber.is_connected());
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_newest() {
        let shutdown = Shutdown::new();
        let publisher = BroadcastPublisher::spawn("media", "127.0.0.1:0", 8, ChannelConfig::default(), shutdown.clone())
            .await
            .unwrap();
        let config = ChannelConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        let mut subscriber = BroadcastSubscriber::spawn(
            "viewer",
            publisher.local_addr().to_string(),
            config,
            shutdown.clone(),
        );

        wait_for(|| publisher.subscriber_count() == 1).await;
        for i in 0..3u8 {
            publisher.try_send(Bytes::from(vec![i])).unwrap();
        }
        wait_for(|| subscriber.stats().received == 3).await;

        assert_eq!(subscriber.try_recv(), Some(Bytes::from(vec![0u8])));
        assert_eq!(subscriber.try_recv(), None);
        assert_eq!(subscriber.stats().dropped, 2);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_slow_subscriber_lag_is_counted() {
        let shutdown = Shutdown::new();
        let publisher = BroadcastPublisher::spawn("media", "127.0.0.1:0", 2, ChannelConfig::default(), shutdown.clone())
            .await
            .unwrap();
        let mut subscriber = BroadcastSubscriber::spawn(
            "viewer",
            publisher.local_addr().to_string(),
            ChannelConfig::default(),
            shutdown.clone(),
        );
        wait_for(|| publisher.subscriber_count() == 1).await;

        // No await between sends, so the subscriber task cannot keep up
        for i in 0..10u8 {
            publisher.try_send(Bytes::from(vec![i])).unwrap();
        }
        wait_for(|| subscriber.stats().received == 2).await;

        assert_eq!(publisher.stats().lagged, 8);
        assert_eq!(subscriber.try_recv(), Some(Bytes::from(vec![8u8])));
        assert_eq!(subscriber.try_recv(), Some(Bytes::from(vec![9u8])));
        assert!(subscriber.is_connected());
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_oversized_frame_keeps_subscriber() {
        let shutdown = Shutdown::new();
        let limits = ChannelConfig {
            max_frame_bytes: 4,
            ..Default::default()
        };
        let publisher = BroadcastPublisher::spawn("media", "127.0.0.1:0", 8, limits, shutdown.clone())
            .await
            .unwrap();
        let mut subscriber = BroadcastSubscriber::spawn(
            "viewer",
            publisher.local_addr().to_string(),
            ChannelConfig::default(),
            shutdown.clone(),
        );
        wait_for(|| publisher.subscriber_count() == 1).await;

        publisher.try_send(Bytes::from_static(b"far too large")).unwrap();
        publisher.try_send(Bytes::from_static(b"ok")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"ok"));
        assert_eq!(publisher.stats().oversized, 1);
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(subscriber.stats().reconnects, 0);
        shutdown.trigger();
    }
}
