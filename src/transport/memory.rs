//! In-process sink
//!
//! Collects messages in memory. Used when embedding the publisher or relay
//! without sockets, and in tests to observe exactly what a leg emitted.

use super::{MessageSink, TransportError};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bounded in-memory message sink
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    capacity: usize,
    messages: ParkingMutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, usize::MAX)
    }

    /// Sink that reports `QueueFull` once `capacity` messages are held
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            messages: ParkingMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every later send fail with `Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything received so far
    pub fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl MessageSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        let mut messages = self.messages.lock();
        if messages.len() >= self.capacity {
            return Err(TransportError::QueueFull(self.name.clone()));
        }
        messages.push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_and_close() {
        let sink = MemorySink::with_capacity("mem", 1);
        sink.try_send(Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            sink.try_send(Bytes::from_static(b"b")),
            Err(TransportError::QueueFull(_))
        ));

        assert_eq!(sink.drain().len(), 1);
        sink.close();
        assert!(matches!(
            sink.try_send(Bytes::from_static(b"c")),
            Err(TransportError::Closed(_))
        ));
        assert!(sink.is_empty());
    }
}
