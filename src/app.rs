//! Notification client: wires session, connection, queue, drainer, and favorites.
//!
//! SYSTEM CONTEXT
//! ==============
//! `NotificationClient` is the composition root. One instance owns one
//! connection manager, one queue, and one drainer; nothing here is process
//! global. Every session gets its own cancellation token, and the drainer,
//! the favorites revalidation task, and the session-loss watcher all run
//! under child tokens of it.
//!
//! Teardown order matters: the transport is disconnected (and its listener
//! unbound) before the queue and favorites are cleared, and before the next
//! session's `connect` can run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::ListenerBridge;
use crate::config::{ClientConfig, ConfigError};
use crate::connection::ConnectionManager;
use crate::connection::transport::TransportListener;
use crate::drainer::{DisplayState, Drainer, spawn_drainer};
use crate::favorites::{FavoritesApi, FavoritesError, FavoritesSync};
use crate::queue::MessageQueue;
use crate::session::{CredentialProvider, Identity, Session, SessionError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Favorites(#[from] FavoritesError),
}

pub struct NotificationClient {
    config: ClientConfig,
    queue: MessageQueue,
    bridge: Arc<ListenerBridge>,
    connection: ConnectionManager,
    drainer: Arc<Drainer>,
    sessions: SessionManager,
    favorites: FavoritesSync,
    lifetime: Mutex<Option<CancellationToken>>,
}

impl NotificationClient {
    #[must_use]
    pub fn new(config: ClientConfig, provider: Arc<dyn CredentialProvider>, api: Arc<dyn FavoritesApi>) -> Self {
        let queue = MessageQueue::new();
        let bridge = Arc::new(ListenerBridge::new(queue.clone()));
        let listener: Arc<dyn TransportListener> = bridge.clone();
        let sessions = SessionManager::new(provider, config.credential_refresh);
        let connection =
            ConnectionManager::with_session_source(config.connection_options(), Some(listener), sessions.subscribe());
        let drainer = Arc::new(Drainer::new(queue.clone(), config.timing));
        let favorites = FavoritesSync::new(api, connection.clone(), sessions.subscribe());

        Self {
            config,
            queue,
            bridge,
            connection,
            drainer,
            sessions,
            favorites,
            lifetime: Mutex::new(None),
        }
    }

    fn lifetime(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.lifetime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Start a session for `identity` and open its notification transport.
    /// Any previous session is torn down first.
    ///
    /// # Errors
    ///
    /// Returns an error if no credential can be issued.
    pub async fn login(&self, identity: Identity) -> Result<Session, ClientError> {
        self.logout();

        let session = self.sessions.start(identity).await?;
        let lifetime = CancellationToken::new();
        if let Some(previous) = self.lifetime().replace(lifetime.clone()) {
            previous.cancel();
        }

        spawn_drainer(self.drainer.clone(), lifetime.child_token());
        self.favorites.spawn_revalidation(self.config.favorites_refetch, lifetime.child_token());
        self.spawn_session_watch(lifetime);

        self.connection.connect(&session.identity, &session.credential);
        info!(identity = %session.identity.id, "logged in");
        Ok(session)
    }

    /// Tear down the current session. Returns whether one was active.
    pub fn logout(&self) -> bool {
        if let Some(lifetime) = self.lifetime().take() {
            lifetime.cancel();
        }
        teardown(&self.connection, &self.queue, &self.favorites);
        let ended = self.sessions.end();
        if ended {
            info!("logged out");
        }
        ended
    }

    /// Credential loss ends the session from inside the refresh loop; this
    /// watcher applies the same teardown as `logout`.
    fn spawn_session_watch(&self, lifetime: CancellationToken) {
        let mut sessions = self.sessions.subscribe();
        let connection = self.connection.clone();
        let queue = self.queue.clone();
        let favorites = self.favorites.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = lifetime.cancelled() => break,
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let lost = sessions.borrow_and_update().is_none();
                        if lost && !lifetime.is_cancelled() {
                            warn!("session lost; tearing down notifications");
                            lifetime.cancel();
                            teardown(&connection, &queue, &favorites);
                            break;
                        }
                    }
                }
            }
        });
    }

    // =========================================================================
    // NOTIFICATIONS
    // =========================================================================

    /// Mute or unmute notifications. Disconnects when connected, otherwise
    /// reconnects with the current session; pending notifications are dropped
    /// either way. Returns whether notifications are now on.
    pub fn toggle_notifications(&self) -> bool {
        let Some(session) = self.sessions.current() else {
            warn!("no session; notification toggle ignored");
            return false;
        };

        let dropped = self.queue.clear();
        if self.connection.is_connected() {
            self.connection.disconnect();
            info!(dropped, "notifications muted");
            false
        } else {
            self.connection.connect(&session.identity, &session.credential);
            info!(dropped, "notifications unmuted");
            true
        }
    }

    /// What the notification area shows right now, as a stream.
    #[must_use]
    pub fn displayed(&self) -> watch::Receiver<DisplayState> {
        self.drainer.subscribe()
    }

    /// Connected flag as last published by the listener bridge.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.bridge.subscribe_connected()
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.sessions.current()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn favorites(&self) -> &FavoritesSync {
        &self.favorites
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        if let Some(lifetime) = self.lifetime().take() {
            lifetime.cancel();
        }
        self.connection.disconnect();
    }
}

fn teardown(connection: &ConnectionManager, queue: &MessageQueue, favorites: &FavoritesSync) {
    connection.disconnect();
    let dropped = queue.clear();
    favorites.clear();
    if dropped > 0 {
        info!(dropped, "dropped pending notifications");
    }
}

#[cfg(test)]
#[path = "app_test.rs"]
mod tests;
