//! Favorites synchronizer.
//!
//! SYSTEM CONTEXT
//! ==============
//! The favorites service is the source of truth. This module keeps a cached
//! snapshot of it (`FavoritesSet`), refetches that snapshot wholesale after
//! every write and on a revalidation schedule, and layers optimistic "liked"
//! flags on top so a toggle shows up before the server confirms it.
//!
//! DESIGN
//! ======
//! Fetching is enabled only while the session watch holds a session with an
//! unexpired credential; otherwise the cache is cleared. Revalidation runs on
//! focus regain, on a fixed interval while focused, and when the identity
//! changes. A credential-only refresh does not trigger it.
//!
//! ERROR HANDLING
//! ==============
//! A failed write or a failed follow-up refetch rolls back the optimistic
//! patch it created and returns the typed error. The `favorite_movie`
//! broadcast after an add is best effort; not being connected is only logged.

pub mod api;
pub mod overlay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::event::OutboundEvent;
use crate::session::Session;
use crate::types::{FavoriteRecord, MovieId};
pub use api::{FavoritesApi, HttpFavoritesApi};
pub use overlay::{FavoritesSet, OptimisticOverlay};

pub const DEFAULT_REFETCH_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum FavoritesError {
    #[error("favorites are disabled without an active session")]
    Disabled,
    #[error("session changed while the favorites request was in flight")]
    SessionChanged,
    #[error("favorites request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("favorites {op} returned status {status}")]
    Status { op: &'static str, status: u16 },
    #[error("favorites request rejected: {0}")]
    Rejected(String),
    #[error("favorites response has no `{0}` field")]
    MissingField(&'static str),
    #[error("favorites response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

struct SyncInner {
    api: Arc<dyn FavoritesApi>,
    connection: ConnectionManager,
    session: watch::Receiver<Option<Session>>,
    cache: RwLock<Option<FavoritesSet>>,
    overlay: Mutex<OptimisticOverlay>,
    focused: AtomicBool,
    focus_regained: Notify,
}

#[derive(Clone)]
pub struct FavoritesSync {
    inner: Arc<SyncInner>,
}

impl FavoritesSync {
    #[must_use]
    pub fn new(
        api: Arc<dyn FavoritesApi>,
        connection: ConnectionManager,
        session: watch::Receiver<Option<Session>>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                api,
                connection,
                session,
                cache: RwLock::new(None),
                overlay: Mutex::new(OptimisticOverlay::default()),
                focused: AtomicBool::new(true),
                focus_regained: Notify::new(),
            }),
        }
    }

    fn overlay(&self) -> MutexGuard<'_, OptimisticOverlay> {
        self.inner.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_cache(&self, value: Option<FavoritesSet>) {
        *self.inner.cache.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// The session fetching is currently allowed under.
    fn active_session(&self) -> Option<Session> {
        self.inner.session.borrow().as_ref().filter(|session| session.has_valid_credential()).cloned()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.active_session().is_some()
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Read the cache as the active session sees it. Without a session holding
    /// a valid credential the cache reads as unloaded, even before the next
    /// refetch gets to clear it.
    fn with_cache<R>(&self, read: impl FnOnce(Option<&FavoritesSet>) -> R) -> R {
        if !self.is_enabled() {
            return read(None);
        }
        let cache = self.inner.cache.read().unwrap_or_else(PoisonError::into_inner);
        read(cache.as_ref())
    }

    /// Membership in the authoritative cache, by movie id only.
    #[must_use]
    pub fn is_favorite(&self, movie_id: MovieId) -> bool {
        self.with_cache(|cache| cache.is_some_and(|set| set.contains(movie_id)))
    }

    /// What the heart button should show: a pending optimistic flag, else the cache.
    #[must_use]
    pub fn is_liked(&self, movie_id: MovieId) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let pending = self.overlay().liked(movie_id);
        pending.unwrap_or_else(|| self.is_favorite(movie_id))
    }

    /// Snapshot of the authoritative cache; empty before the first fetch.
    #[must_use]
    pub fn favorites(&self) -> Vec<FavoriteRecord> {
        self.with_cache(|cache| cache.map(FavoritesSet::to_vec).unwrap_or_default())
    }

    /// Whether a fetch has populated the cache since it was last cleared.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.with_cache(|cache| cache.is_some())
    }

    #[must_use]
    pub fn pending_patches(&self) -> usize {
        self.overlay().pending()
    }

    // =========================================================================
    // FETCH
    // =========================================================================

    /// Replace the cache with the server's current set. Returns its size.
    ///
    /// # Errors
    ///
    /// `Disabled` (cache cleared) without a usable session, `SessionChanged`
    /// if the identity changed before the response arrived, or the API error.
    pub async fn refetch(&self) -> Result<usize, FavoritesError> {
        let Some(session) = self.active_session() else {
            self.clear();
            return Err(FavoritesError::Disabled);
        };

        let records = self.inner.api.list(&session.credential).await?;

        let same_identity = self
            .active_session()
            .is_some_and(|current| current.identity.id == session.identity.id);
        if !same_identity {
            debug!(identity = %session.identity.id, "discarding favorites fetched for a previous session");
            return Err(FavoritesError::SessionChanged);
        }

        let set = FavoritesSet::from_records(records);
        let count = set.len();
        self.set_cache(Some(set));
        debug!(identity = %session.identity.id, count, "favorites refreshed");
        Ok(count)
    }

    /// Drop the cache and every pending optimistic patch.
    pub fn clear(&self) {
        self.set_cache(None);
        self.overlay().clear();
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Store `movie` as a favorite, broadcast it, then refetch.
    ///
    /// # Errors
    ///
    /// Returns the API error of the write or of the follow-up refetch. The
    /// optimistic flag is rolled back in both cases.
    pub async fn add_favorite(&self, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        let session = self.active_session().ok_or(FavoritesError::Disabled)?;
        let correlation = self.overlay().apply(movie.movie_id, true);

        if let Err(error) = self.inner.api.add(&session.credential, movie).await {
            self.overlay().rollback(movie.movie_id, correlation);
            warn!(movie = %movie.movie_id, %error, "add favorite failed; rolled back");
            return Err(error);
        }
        info!(movie = %movie.movie_id, title = %movie.title, "favorite added");

        let broadcast = OutboundEvent::FavoriteMovie {
            movie: movie.clone(),
            user_name: session.identity.display_name.clone(),
        };
        if !self.inner.connection.send(&broadcast) {
            debug!(movie = %movie.movie_id, "favorite broadcast not sent");
        }

        self.settle(movie.movie_id, correlation).await
    }

    /// Remove `movie` from the favorites, then refetch. Nothing is broadcast.
    ///
    /// # Errors
    ///
    /// Same as [`FavoritesSync::add_favorite`].
    pub async fn remove_favorite(&self, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        let session = self.active_session().ok_or(FavoritesError::Disabled)?;
        let correlation = self.overlay().apply(movie.movie_id, false);

        if let Err(error) = self.inner.api.remove(&session.credential, movie).await {
            self.overlay().rollback(movie.movie_id, correlation);
            warn!(movie = %movie.movie_id, %error, "remove favorite failed; rolled back");
            return Err(error);
        }
        info!(movie = %movie.movie_id, "favorite removed");

        self.settle(movie.movie_id, correlation).await
    }

    /// Heart-button handler. Returns the new liked flag.
    ///
    /// # Errors
    ///
    /// Same as [`FavoritesSync::add_favorite`].
    pub async fn toggle(&self, movie: &FavoriteRecord) -> Result<bool, FavoritesError> {
        if self.is_liked(movie.movie_id) {
            self.remove_favorite(movie).await.map(|()| false)
        } else {
            self.add_favorite(movie).await.map(|()| true)
        }
    }

    async fn settle(&self, movie_id: MovieId, correlation: Uuid) -> Result<(), FavoritesError> {
        match self.refetch().await {
            Ok(_) => {
                self.overlay().settle(movie_id, correlation);
                Ok(())
            }
            Err(error) => {
                self.overlay().rollback(movie_id, correlation);
                warn!(movie = %movie_id, %error, "refetch after write failed; rolled back");
                Err(error)
            }
        }
    }

    // =========================================================================
    // REVALIDATION
    // =========================================================================

    /// Window regained focus: resume the interval and revalidate now.
    pub fn window_focused(&self) {
        self.inner.focused.store(true, Ordering::Release);
        self.inner.focus_regained.notify_one();
    }

    /// Window lost focus: the interval stops firing until focus returns.
    pub fn window_blurred(&self) {
        self.inner.focused.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.inner.focused.load(Ordering::Acquire)
    }

    async fn revalidate(&self, reason: &'static str) {
        match self.refetch().await {
            Ok(count) => debug!(reason, count, "favorites revalidated"),
            Err(FavoritesError::Disabled | FavoritesError::SessionChanged) => {}
            Err(error) => warn!(reason, %error, "favorites revalidation failed"),
        }
    }

    /// Spawn the revalidation task. Fetches once immediately if a session is
    /// active, then on every trigger until `cancel` fires.
    pub fn spawn_revalidation(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let sync = self.clone();
        let mut session = self.inner.session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut identity = session.borrow_and_update().as_ref().map(|s| s.identity.id.clone());
            if identity.is_some() {
                sync.revalidate("enabled").await;
            }

            loop {
                let reason = tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !sync.is_focused() {
                            continue;
                        }
                        "interval"
                    }
                    () = sync.inner.focus_regained.notified() => "focus",
                    changed = session.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = session.borrow_and_update().as_ref().map(|s| s.identity.id.clone());
                        if next == identity {
                            continue;
                        }
                        identity = next;
                        if identity.is_none() {
                            sync.clear();
                            continue;
                        }
                        "identity"
                    }
                };
                sync.revalidate(reason).await;
            }
            debug!("favorites revalidation stopped");
        })
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
