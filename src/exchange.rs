//! Latest-frame exchange between the receive thread and the engine tick.
//!
//! The producer overwrites, the consumer takes. The producer never waits on
//! the consumer, so a slow tick only ever sees the freshest frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct FrameSlot<T> {
    slot: Mutex<Option<T>>,
    overwrites: AtomicU64,
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            overwrites: AtomicU64::new(0),
        }
    }
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the unconsumed value it replaced.
    pub fn publish(&self, value: T) -> Option<T> {
        let replaced = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(value);
        if replaced.is_some() {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn clear(&self) {
        self.take();
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Values replaced before anyone took them.
    pub fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::Relaxed)
    }
}
