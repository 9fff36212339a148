//! Outgoing coalescing window.

use std::time::{Duration, Instant};

/// Collects items until the batch is full or the window since the first
/// pending item has elapsed. Order is preserved.
#[derive(Debug)]
pub struct Batcher<T> {
    pending: Vec<T>,
    opened_at: Option<Instant>,
    window: Duration,
    max_size: usize,
}

impl<T> Batcher<T> {
    /// Create a batcher. A `max_size` of zero is treated as one.
    pub fn new(window: Duration, max_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            opened_at: None,
            window,
            max_size: max_size.max(1),
        }
    }

    /// Add an item; returns the batch if this filled it.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            self.opened_at = Some(now);
        }
        self.pending.push(item);
        if self.pending.len() >= self.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Returns the batch if its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => Some(self.flush()),
            _ => None,
        }
    }

    /// Take everything pending.
    pub fn flush(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.pending)
    }

    /// When the current window closes.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.window)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
