//! Latest-only value holder
//!
//! A single slot shared between one writer context and any number of
//! readers. Writing always replaces whatever is there, consumed or not.

use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-slot holder with latest-only semantics
#[derive(Debug)]
pub struct LatestSlot<T> {
    value: ParkingMutex<Option<T>>,
    /// Number of values written over an unconsumed previous value
    overwritten: AtomicU64,
}

impl<T> LatestSlot<T> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self {
            value: ParkingMutex::new(None),
            overwritten: AtomicU64::new(0),
        }
    }

    /// Store a value, replacing any previous one
    pub fn put(&self, value: T) {
        let previous = self.value.lock().replace(value);
        if previous.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the value out, leaving the slot empty
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Whether a value is waiting
    pub fn is_filled(&self) -> bool {
        self.value.lock().is_some()
    }

    /// How many values were replaced before anyone consumed them
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl<T: Clone> LatestSlot<T> {
    /// Copy of the current value without consuming it
    pub fn peek(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_replaces_unconsumed_value() {
        let slot = LatestSlot::new();
        slot.put(1);
        slot.put(2);
        assert_eq!(slot.overwritten(), 1);
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let slot = LatestSlot::new();
        slot.put("frame".to_string());
        assert_eq!(slot.peek().as_deref(), Some("frame"));
        assert!(slot.is_filled());
    }
}
