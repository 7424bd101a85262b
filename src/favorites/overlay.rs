//! Authoritative favorites snapshot and the optimistic overlay on top of it.
//!
//! DESIGN
//! ======
//! `FavoritesSet` is only ever replaced wholesale by a refetch. Optimistic
//! toggles live beside it in `OptimisticOverlay`, one patch per movie, each
//! tagged with a correlation id. Settling or rolling back a patch only touches
//! it if the id still matches, so an older request finishing late cannot undo
//! a newer toggle of the same movie.

use std::collections::BTreeMap;
use std::collections::HashMap;

use uuid::Uuid;

use crate::types::{FavoriteRecord, MovieId};

/// Server-confirmed favorites keyed by movie id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FavoritesSet {
    records: BTreeMap<MovieId, FavoriteRecord>,
}

impl FavoritesSet {
    /// Build from a fetched list. A repeated id keeps the last record.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = FavoriteRecord>) -> Self {
        Self { records: records.into_iter().map(|record| (record.movie_id, record)).collect() }
    }

    #[must_use]
    pub fn contains(&self, movie_id: MovieId) -> bool {
        self.records.contains_key(&movie_id)
    }

    #[must_use]
    pub fn get(&self, movie_id: MovieId) -> Option<&FavoriteRecord> {
        self.records.get(&movie_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FavoriteRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<FavoriteRecord> {
        self.records.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Patch {
    correlation: Uuid,
    liked: bool,
}

/// Pending optimistic "liked" flags awaiting authoritative settlement.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    patches: HashMap<MovieId, Patch>,
}

impl OptimisticOverlay {
    /// Record an optimistic flag for `movie_id`, replacing any older patch.
    pub fn apply(&mut self, movie_id: MovieId, liked: bool) -> Uuid {
        let correlation = Uuid::new_v4();
        self.patches.insert(movie_id, Patch { correlation, liked });
        correlation
    }

    /// Drop the patch because the authoritative set now reflects it.
    pub fn settle(&mut self, movie_id: MovieId, correlation: Uuid) -> bool {
        self.remove_matching(movie_id, correlation)
    }

    /// Drop the patch because the write or the refetch failed.
    pub fn rollback(&mut self, movie_id: MovieId, correlation: Uuid) -> bool {
        self.remove_matching(movie_id, correlation)
    }

    fn remove_matching(&mut self, movie_id: MovieId, correlation: Uuid) -> bool {
        match self.patches.get(&movie_id) {
            Some(patch) if patch.correlation == correlation => {
                self.patches.remove(&movie_id);
                true
            }
            _ => false,
        }
    }

    /// The optimistic flag for `movie_id`, if one is pending.
    #[must_use]
    pub fn liked(&self, movie_id: MovieId) -> Option<bool> {
        self.patches.get(&movie_id).map(|patch| patch.liked)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.patches.len()
    }

    pub fn clear(&mut self) {
        self.patches.clear();
    }
}

#[cfg(test)]
#[path = "overlay_test.rs"]
mod tests;
