//! Shared movie types used by the favorites cache and the notification wire.
//!
//! SYSTEM CONTEXT
//! ==============
//! `FavoriteRecord` is both the body of favorites REST calls and the `movie`
//! payload carried by notification frames, so its serde names follow the
//! catalog feed (`vote_average`, `original_language`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Catalog identifier of a movie. Identity key of the favorites set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovieId(pub i64);

impl fmt::Display for MovieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One favorited movie as stored by the favorites service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteRecord {
    #[serde(rename = "id")]
    pub movie_id: MovieId,
    pub title: String,
    #[serde(rename = "vote_average", default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(rename = "original_language", default)]
    pub language: Option<String>,
}

impl FavoriteRecord {
    /// Minimal record with only the identity and title populated.
    #[must_use]
    pub fn new(movie_id: i64, title: impl Into<String>) -> Self {
        Self {
            movie_id: MovieId(movie_id),
            title: title.into(),
            rating: None,
            poster_path: None,
            release_date: None,
            language: None,
        }
    }

    /// Year prefix of `release_date` (`"2019-04-26"` -> `"2019"`).
    #[must_use]
    pub fn release_year(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .and_then(|date| date.split('-').next())
            .filter(|year| !year.is_empty())
    }

    /// Rating rendered with one decimal, or `"N/A"` when unrated.
    #[must_use]
    pub fn rating_label(&self) -> String {
        match self.rating {
            Some(rating) if rating > 0.0 => format!("{rating:.1}"),
            _ => "N/A".to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
