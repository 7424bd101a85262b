//! Message queue between the listener bridge and the notification drainer.
//!
//! DESIGN
//! ======
//! FIFO, unbounded, tail-append by the bridge and head-pop by the drainer.
//! The deque lives behind a shared handle so every reader sees the live
//! queue, never a copy captured earlier. Each append raises an arrival signal;
//! `Notify` keeps one permit when nobody is waiting, so an append that lands
//! while the drainer is busy is not lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::event::InboundEvent;

#[derive(Default)]
struct QueueInner {
    events: Mutex<VecDeque<InboundEvent>>,
    arrived: Notify,
}

/// Cloneable handle to one shared queue.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<InboundEvent>> {
        self.inner.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail and signal arrival. Returns the new depth.
    pub fn push(&self, event: InboundEvent) -> usize {
        let depth = {
            let mut events = self.events();
            events.push_back(event);
            events.len()
        };
        self.inner.arrived.notify_one();
        depth
    }

    /// Remove and return the head.
    pub fn pop_front(&self) -> Option<InboundEvent> {
        self.events().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Drop every pending event. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut events = self.events();
        let dropped = events.len();
        events.clear();
        dropped
    }

    /// Copy of the pending events in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InboundEvent> {
        self.events().iter().cloned().collect()
    }

    /// Wait for the next arrival signal (or consume a pending one).
    pub async fn arrived(&self) {
        self.inner.arrived.notified().await;
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod tests;
