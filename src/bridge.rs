//! Listener bridge between transport callbacks and the message queue.
//!
//! The connection manager binds one bridge to every transport it creates and
//! the transport drops that binding on close, so a closed transport has no
//! path into the queue. Frames that fail to decode are logged and dropped
//! here; they never reach the drainer.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::transport::{TransportId, TransportListener};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::event::InboundEvent;
use crate::queue::MessageQueue;

pub struct ListenerBridge {
    queue: MessageQueue,
    connected: watch::Sender<bool>,
    rejected: AtomicUsize,
}

impl ListenerBridge {
    #[must_use]
    pub fn new(queue: MessageQueue) -> Self {
        let (connected, _) = watch::channel(false);
        Self { queue, connected, rejected: AtomicUsize::new(0) }
    }

    /// `is_connected()` as observed after the latest open or close callback.
    #[must_use]
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Count of inbound frames dropped because they did not decode.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl TransportListener for ListenerBridge {
    fn on_open(&self, connection: &ConnectionManager, transport: TransportId) {
        let connected = connection.is_connected();
        self.connected.send_replace(connected);
        info!(transport, connected, "notifications connected");
    }

    fn on_close(&self, connection: &ConnectionManager, transport: TransportId) {
        let connected = connection.is_connected();
        self.connected.send_replace(connected);
        info!(transport, connected, "notifications disconnected");
    }

    fn on_error(&self, transport: TransportId, error: &ConnectionError) {
        warn!(transport, %error, "notification transport error");
    }

    fn on_message(&self, transport: TransportId, text: &str) {
        match InboundEvent::decode(text) {
            Ok(event) => {
                let kind = event.kind();
                let depth = self.queue.push(event);
                debug!(transport, kind, depth, "notification queued");
            }
            Err(error) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(transport, %error, "dropping inbound frame");
            }
        }
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;
