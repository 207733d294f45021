//! Bounded FIFO deferring work out of interrupt-like contexts.
//!
//! Receive and alarm handlers only enqueue events; the owner drains them from
//! its processing loop, so long handler chains never run nested inside a
//! transceiver or alarm callback.

use heapless::Deque;

use crate::error::{Error, Result};

/// Default number of pending events a station can hold.
pub const EVENT_QUEUE_SIZE: usize = 16;

#[derive(Debug)]
pub struct EventQueue<E, const N: usize> {
    events: Deque<E, N>,
}

impl<E, const N: usize> EventQueue<E, N> {
    pub fn new() -> Self {
        Self { events: Deque::new() }
    }

    /// Appends an event, failing with [`Error::QueueFull`] at capacity.
    pub fn enqueue(&mut self, event: E) -> Result<()> {
        self.events.push_back(event).map_err(|_| Error::QueueFull)
    }

    /// Removes the oldest event.
    pub fn dequeue(&mut self) -> Option<E> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events that can still be enqueued.
    pub fn free(&self) -> usize {
        N - self.events.len()
    }
}

impl<E, const N: usize> Default for EventQueue<E, N> {
    fn default() -> Self {
        Self::new()
    }
}
