//! Connection manager for the per-user notification socket.
//!
//! SYSTEM CONTEXT
//! ==============
//! The server exposes one websocket per user at `<socket base>/<user id>`,
//! authenticated with the session credential as a query parameter. This
//! module owns the single active transport: it opens it, closes it with a
//! normal close, reports connected state, and sends outbound frames.
//!
//! DESIGN
//! ======
//! `ConnectionManager` is a cheap clone over shared state. All flags live
//! under one mutex so `connect` can check-and-set "connecting or connected"
//! atomically, which is what keeps two transports from ever being live at
//! once. Each transport gets a fresh id; lifecycle reports from a transport
//! that is no longer the current one are ignored.
//!
//! ERROR HANDLING
//! ==============
//! Handshake and socket failures are logged and surfaced to the bound
//! listener through `on_error`, then treated as a close. Reconnecting after
//! an unexpected close is opt-in (`ReconnectPolicy`); a user-initiated
//! disconnect never schedules one. A manager built with a session source
//! reconnects with the session's current credential and skips the retry
//! when that session is gone or expired.

pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Url;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::OutboundEvent;
use crate::session::{Credential, Identity, Session};
use transport::{ReadyState, TransportHandle, TransportId, TransportListener};

pub const DEFAULT_CREDENTIAL_PARAM: &str = "credential";
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid socket base URL `{0}`")]
    InvalidBaseUrl(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket I/O failed: {0}")]
    Socket(Box<tokio_tungstenite::tungstenite::Error>),
}

/// Coarse connection status published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Automatic reconnection after an unexpected close. Disabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

/// Static settings of a `ConnectionManager`.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// `ws://` or `wss://` base; the user id is appended as a path segment.
    pub socket_base_url: String,
    /// Query parameter carrying the credential.
    pub credential_param: String,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(socket_base_url: impl Into<String>) -> Self {
        Self {
            socket_base_url: socket_base_url.into(),
            credential_param: DEFAULT_CREDENTIAL_PARAM.to_owned(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Build `<base>/<user id>?<param>=<credential>`.
///
/// # Errors
///
/// Returns an error if `base` is not an absolute `ws`/`wss` URL.
pub fn transport_url(
    base: &str,
    param: &str,
    identity: &Identity,
    credential: &Credential,
) -> Result<Url, ConnectionError> {
    let invalid = || ConnectionError::InvalidBaseUrl(base.to_owned());
    let mut url = Url::parse(base).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid());
    }
    url.path_segments_mut().map_err(|()| invalid())?.pop_if_empty().push(&identity.id);
    url.query_pairs_mut().append_pair(param, credential.as_str());
    Ok(url)
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Default)]
struct Inner {
    transport: Option<Arc<TransportHandle>>,
    connecting: bool,
    connected: bool,
    reconnect_attempts: u32,
    last_params: Option<(Identity, Credential)>,
    pending_retry: Option<CancellationToken>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else if self.connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    fn is_current(&self, handle: &TransportHandle) -> bool {
        self.transport.as_ref().is_some_and(|current| current.id() == handle.id())
    }
}

struct Shared {
    options: ConnectionOptions,
    listener: Option<Arc<dyn TransportListener>>,
    sessions: Option<watch::Receiver<Option<Session>>>,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// `listener` is bound to every transport this manager creates.
    #[must_use]
    pub fn new(options: ConnectionOptions, listener: Option<Arc<dyn TransportListener>>) -> Self {
        Self::build(options, listener, None)
    }

    /// Like [`ConnectionManager::new`], but reconnects read the credential
    /// from `sessions` instead of reusing the one given to `connect`.
    #[must_use]
    pub fn with_session_source(
        options: ConnectionOptions,
        listener: Option<Arc<dyn TransportListener>>,
        sessions: watch::Receiver<Option<Session>>,
    ) -> Self {
        Self::build(options, listener, Some(sessions))
    }

    fn build(
        options: ConnectionOptions,
        listener: Option<Arc<dyn TransportListener>>,
        sessions: Option<watch::Receiver<Option<Session>>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                options,
                listener,
                sessions,
                next_id: AtomicU64::new(0),
                inner: Mutex::new(Inner::default()),
                state,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        let next = inner.state();
        self.shared.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    /// Open a transport for `identity`. No-op while one is connecting or connected.
    pub fn connect(&self, identity: &Identity, credential: &Credential) {
        let mut inner = self.inner();
        if inner.connecting || inner.connected {
            warn!(identity = %identity.id, "notification transport already connecting or connected");
            return;
        }

        let url = match transport_url(
            &self.shared.options.socket_base_url,
            &self.shared.options.credential_param,
            identity,
            credential,
        ) {
            Ok(url) => url,
            Err(error) => {
                error!(%error, "cannot open notification transport");
                return;
            }
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, outbound) = TransportHandle::new(id);
        if let Some(listener) = &self.shared.listener {
            handle.bind(listener.clone());
        }
        if let Some(previous) = inner.transport.replace(handle.clone()) {
            previous.unbind();
        }
        inner.connecting = true;
        inner.last_params = Some((identity.clone(), credential.clone()));
        self.publish(&inner);
        drop(inner);

        info!(transport = id, identity = %identity.id, "opening notification transport");
        tokio::spawn(transport::run_transport(self.clone(), handle, url.to_string(), outbound));
    }

    /// Close the current transport with a normal close and reset all state.
    pub fn disconnect(&self) {
        let handle = {
            let mut inner = self.inner();
            if let Some(retry) = inner.pending_retry.take() {
                retry.cancel();
            }
            inner.connecting = false;
            inner.connected = false;
            inner.reconnect_attempts = 0;
            inner.last_params = None;
            self.publish(&inner);
            inner.transport.take()
        };

        let Some(handle) = handle else {
            return;
        };
        info!(transport = handle.id(), "closing notification transport");
        handle.close_normal();
        handle.emit_close(self);
    }

    /// Send `event` if connected. Returns whether it was queued on the socket.
    pub fn send(&self, event: &OutboundEvent) -> bool {
        let handle = {
            let inner = self.inner();
            if !inner.connected {
                None
            } else {
                inner.transport.clone()
            }
        };
        let Some(handle) = handle.filter(|handle| handle.ready_state() == ReadyState::Open) else {
            debug!(kind = event.kind(), "not connected; frame not sent");
            return false;
        };

        match event.encode() {
            Ok(text) => {
                let sent = handle.send_text(text);
                if !sent {
                    warn!(transport = handle.id(), kind = event.kind(), "transport refused frame");
                }
                sent
            }
            Err(error) => {
                warn!(kind = event.kind(), %error, "failed to encode outbound frame");
                false
            }
        }
    }

    /// True only when a transport exists, is open, and the open handshake completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let inner = self.inner();
        inner.connected
            && inner.transport.as_ref().is_some_and(|handle| handle.ready_state() == ReadyState::Open)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner().reconnect_attempts
    }

    /// Id of the current transport, if any.
    #[must_use]
    pub fn transport_id(&self) -> Option<TransportId> {
        self.inner().transport.as_ref().map(|handle| handle.id())
    }

    // =========================================================================
    // TRANSPORT CALLBACKS
    // =========================================================================

    pub(crate) fn transport_opened(&self, handle: &TransportHandle) {
        let mut inner = self.inner();
        if !inner.is_current(handle) {
            return;
        }
        inner.connecting = false;
        inner.connected = true;
        inner.reconnect_attempts = 0;
        self.publish(&inner);
        info!(transport = handle.id(), "notification transport open");
    }

    pub(crate) fn transport_ended(&self, handle: &TransportHandle, failed: bool) {
        let mut inner = self.inner();
        if !inner.is_current(handle) {
            return;
        }
        inner.connecting = false;
        inner.connected = false;
        self.publish(&inner);
        if failed {
            debug!(transport = handle.id(), "current transport failed");
        }
        if !handle.closed_by_user() {
            self.schedule_reconnect(&mut inner);
        }
    }

    fn schedule_reconnect(&self, inner: &mut Inner) {
        let policy = self.shared.options.reconnect;
        if !policy.enabled {
            return;
        }
        let Some((identity, credential)) = inner.last_params.clone() else {
            return;
        };
        if inner.reconnect_attempts >= policy.max_attempts {
            warn!(attempts = inner.reconnect_attempts, "giving up on notification reconnect");
            return;
        }

        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        let cancel = CancellationToken::new();
        if let Some(previous) = inner.pending_retry.replace(cancel.clone()) {
            previous.cancel();
        }
        info!(attempt, delay = ?policy.delay, "scheduling notification reconnect");

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(policy.delay) => {}
            }
            manager.inner().pending_retry = None;
            let Some(credential) = manager.retry_credential(&identity, credential) else {
                info!(identity = %identity.id, "no valid session for reconnect; staying disconnected");
                return;
            };
            manager.connect(&identity, &credential);
        });
    }

    /// Credential for a retry. With a session source attached this is the
    /// live session's credential, and `None` unless that session is valid and
    /// belongs to `identity`. Without one it is the credential captured at
    /// `connect`.
    fn retry_credential(&self, identity: &Identity, captured: Credential) -> Option<Credential> {
        let Some(sessions) = &self.shared.sessions else {
            return Some(captured);
        };
        sessions
            .borrow()
            .as_ref()
            .filter(|session| session.identity.id == identity.id && session.has_valid_credential())
            .map(|session| session.credential.clone())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
