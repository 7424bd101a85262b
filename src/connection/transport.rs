//! One websocket transport instance and its io task.
//!
//! DESIGN
//! ======
//! `TransportHandle` is the shared face of a single socket: its low-level
//! ready state, its outbound queue, and the one listener currently bound to
//! it. The io task owns the socket halves. It reports lifecycle changes to the
//! manager first (state flags) and to the bound listener second, and only ever
//! forwards inbound text to whichever listener is bound at that moment, so an
//! unbound transport cannot deliver anything.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use super::{ConnectionError, ConnectionManager};
use crate::event::OutboundEvent;

pub type TransportId = u64;

const CLOSE_REASON: &str = "User disconnected";

/// Low-level socket state, mirroring the browser `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Callbacks bound to one transport instance.
pub trait TransportListener: Send + Sync {
    fn on_open(&self, _connection: &ConnectionManager, _transport: TransportId) {}
    fn on_close(&self, _connection: &ConnectionManager, _transport: TransportId) {}
    fn on_error(&self, _transport: TransportId, _error: &ConnectionError) {}
    fn on_message(&self, transport: TransportId, text: &str);
}

// =============================================================================
// HANDLE
// =============================================================================

pub struct TransportHandle {
    id: TransportId,
    ready: AtomicU8,
    closed_by_user: AtomicBool,
    outbound: mpsc::UnboundedSender<Message>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
}

impl TransportHandle {
    pub(crate) fn new(id: TransportId) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            ready: AtomicU8::new(ReadyState::Connecting as u8),
            closed_by_user: AtomicBool::new(false),
            outbound,
            listener: Mutex::new(None),
        };
        (Arc::new(handle), rx)
    }

    #[must_use]
    pub fn id(&self) -> TransportId {
        self.id
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn closed_by_user(&self) -> bool {
        self.closed_by_user.load(Ordering::Acquire)
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<Arc<dyn TransportListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `listener`, replacing any previous binding.
    pub fn bind(&self, listener: Arc<dyn TransportListener>) {
        *self.listener_slot() = Some(listener);
    }

    /// Remove the binding. Returns whether one existed.
    pub fn unbind(&self) -> bool {
        self.listener_slot().take().is_some()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.listener_slot().is_some()
    }

    /// Connecting -> Open. Fails if the handle was closed while the handshake ran.
    pub(crate) fn mark_open(&self) -> bool {
        self.ready
            .compare_exchange(
                ReadyState::Connecting as u8,
                ReadyState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.ready.store(ReadyState::Closed as u8, Ordering::Release);
    }

    /// Queue a text frame. Only accepted while the socket is open.
    pub(crate) fn send_text(&self, text: String) -> bool {
        self.ready_state() == ReadyState::Open && self.outbound.send(Message::text(text)).is_ok()
    }

    /// Start a normal (1000) close initiated by this client.
    pub(crate) fn close_normal(&self) {
        self.closed_by_user.store(true, Ordering::Release);
        let _ = self.ready.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            (ReadyState::from_u8(raw) != ReadyState::Closed).then_some(ReadyState::Closing as u8)
        });
        let frame = CloseFrame { code: CloseCode::Normal, reason: CLOSE_REASON.into() };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    pub(crate) fn emit_open(&self, connection: &ConnectionManager) {
        let listener = self.listener_slot().clone();
        if let Some(listener) = listener {
            listener.on_open(connection, self.id);
        }
    }

    pub(crate) fn emit_error(&self, error: &ConnectionError) {
        let listener = self.listener_slot().clone();
        if let Some(listener) = listener {
            listener.on_error(self.id, error);
        }
    }

    pub(crate) fn emit_message(&self, text: &str) {
        let listener = self.listener_slot().clone();
        if let Some(listener) = listener {
            listener.on_message(self.id, text);
        }
    }

    /// Deliver the close callback once, unbinding the listener first.
    pub(crate) fn emit_close(&self, connection: &ConnectionManager) {
        let listener = self.listener_slot().take();
        if let Some(listener) = listener {
            listener.on_close(connection, self.id);
        }
    }
}

// =============================================================================
// IO TASK
// =============================================================================

/// Open the socket and pump frames until either side closes it.
pub(crate) async fn run_transport(
    connection: ConnectionManager,
    handle: Arc<TransportHandle>,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            let error = ConnectionError::Handshake(Box::new(error));
            finish(&connection, &handle, Some(error));
            return;
        }
    };
    let (mut write, mut read) = stream.split();

    if !handle.mark_open() {
        debug!(transport = handle.id(), "transport closed during handshake; dropping socket");
        let _ = write.close().await;
        handle.mark_closed();
        return;
    }

    match OutboundEvent::heartbeat().encode() {
        Ok(text) => {
            if let Err(error) = write.send(Message::text(text)).await {
                finish(&connection, &handle, Some(ConnectionError::Socket(Box::new(error))));
                return;
            }
        }
        Err(error) => warn!(transport = handle.id(), %error, "heartbeat encode failed"),
    }

    connection.transport_opened(&handle);
    handle.emit_open(&connection);

    let failure = loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else {
                    break None;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(error) = write.send(message).await {
                    break Some(ConnectionError::Socket(Box::new(error)));
                }
                if closing {
                    break None;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle.emit_message(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(transport = handle.id(), ?frame, "server closed transport");
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => break Some(ConnectionError::Socket(Box::new(error))),
                None => break None,
            },
        }
    };

    finish(&connection, &handle, failure);
}

fn finish(connection: &ConnectionManager, handle: &TransportHandle, failure: Option<ConnectionError>) {
    handle.mark_closed();
    match &failure {
        Some(error) => {
            warn!(transport = handle.id(), %error, "notification transport failed");
            connection.transport_ended(handle, true);
            handle.emit_error(error);
        }
        None => {
            debug!(transport = handle.id(), "notification transport closed");
            connection.transport_ended(handle, false);
        }
    }
    handle.emit_close(connection);
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
