//! Session lifecycle and credential refresh.
//!
//! SYSTEM CONTEXT
//! ==============
//! Credential issuance is an external collaborator (`CredentialProvider`).
//! `SessionManager` owns the active `Session`, refreshes its credential on a
//! fixed cadence, and publishes every change on a watch channel. Connection
//! and favorites code react to that channel; nothing else creates sessions.
//!
//! ERROR HANDLING
//! ==============
//! A failed refresh is treated as credential loss: the session is withdrawn
//! (published as `None`) so dependents tear down instead of running with a
//! token the server will reject.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CREDENTIAL_REFRESH_SECS: u64 = 600;

// =============================================================================
// TYPES
// =============================================================================

/// Who the current user is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Opaque user id, embedded in the notification URL.
    pub id: String,
    /// Name shown to other users in favorite broadcasts.
    pub display_name: String,
}

impl Identity {
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into() }
    }
}

/// Short-lived bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A freshly issued credential and how long it stays valid.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub credential: Credential,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub credential: Credential,
    pub credential_expiry: Instant,
}

impl Session {
    #[must_use]
    pub fn new(identity: Identity, issued: IssuedCredential) -> Self {
        Self { identity, credential: issued.credential, credential_expiry: Instant::now() + issued.ttl }
    }

    #[must_use]
    pub fn has_valid_credential(&self) -> bool {
        Instant::now() < self.credential_expiry
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("credential issuance failed: {0}")]
    Issue(String),
    #[error("no active session")]
    NoSession,
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Issues bearer credentials for an identity.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self, identity: &Identity) -> Result<IssuedCredential, SessionError>;
}

/// Hands out one pre-obtained token, e.g. from the command line.
pub struct StaticCredentialProvider {
    credential: Credential,
    ttl: Duration,
}

impl StaticCredentialProvider {
    #[must_use]
    pub fn new(credential: Credential, ttl: Duration) -> Self {
        Self { credential, ttl }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn issue(&self, _identity: &Identity) -> Result<IssuedCredential, SessionError> {
        Ok(IssuedCredential { credential: self.credential.clone(), ttl: self.ttl })
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

pub struct SessionManager {
    provider: Arc<dyn CredentialProvider>,
    refresh_every: Duration,
    current: Arc<watch::Sender<Option<Session>>>,
    refresh: Mutex<Option<CancellationToken>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(provider: Arc<dyn CredentialProvider>, refresh_every: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self { provider, refresh_every, current: Arc::new(current), refresh: Mutex::new(None) }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.current.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.current.borrow().clone()
    }

    /// Issue a credential for `identity`, publish the session, and start the
    /// refresh cadence. Any previous session is ended first.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot issue a credential.
    pub async fn start(&self, identity: Identity) -> Result<Session, SessionError> {
        self.end();

        let issued = self.provider.issue(&identity).await?;
        let session = Session::new(identity.clone(), issued);
        self.current.send_replace(Some(session.clone()));
        info!(identity = %identity.id, "session started");

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
        }
        tokio::spawn(refresh_loop(
            self.provider.clone(),
            self.current.clone(),
            identity,
            self.refresh_every,
            cancel,
        ));

        Ok(session)
    }

    /// Withdraw the session and stop refreshing. Returns whether one was active.
    pub fn end(&self) -> bool {
        if let Some(cancel) = self.refresh.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
        }
        let previous = self.current.send_replace(None);
        if let Some(session) = &previous {
            info!(identity = %session.identity.id, "session ended");
        }
        previous.is_some()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.refresh.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
        }
    }
}

async fn refresh_loop(
    provider: Arc<dyn CredentialProvider>,
    current: Arc<watch::Sender<Option<Session>>>,
    identity: Identity,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let issued = provider.issue(&identity).await;
        if cancel.is_cancelled() {
            break;
        }
        match issued {
            Ok(issued) => {
                current.send_replace(Some(Session::new(identity.clone(), issued)));
                debug!(identity = %identity.id, "credential refreshed");
            }
            Err(error) => {
                warn!(identity = %identity.id, %error, "credential refresh failed; ending session");
                current.send_replace(None);
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
