//! Notification wire contract: inbound server events and outbound client frames.
//!
//! DESIGN
//! ======
//! Inbound frames are JSON text keyed by `type`. Decoding is strict: the tag
//! is checked against the known set before the payload is parsed, so an
//! unknown tag is reported as such instead of surfacing as a generic serde
//! failure. Only three tags are user-facing notifications; the rest are
//! protocol traffic the drainer refuses to display. The `movie` echoed on a
//! notification is decoded leniently: a shape we cannot read is dropped and
//! the notification text still goes through.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::FavoriteRecord;

/// Tags the drainer is allowed to put on screen.
pub const DISPLAY_TYPES: [&str; 3] = ["connection_established", "favorite_confirmed", "new_favorite"];

const KNOWN_TYPES: [&str; 5] = [
    "ping",
    "connection_established",
    "favorite_confirmed",
    "new_favorite",
    "favorite_movie",
];

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no string `type` tag")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// INBOUND
// =============================================================================

/// Server-originated event, one per text frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    ConnectionEstablished {
        message: String,
    },
    FavoriteConfirmed {
        message: String,
        #[serde(default, deserialize_with = "lenient_movie")]
        movie: Option<FavoriteRecord>,
    },
    NewFavorite {
        message: String,
        #[serde(default, deserialize_with = "lenient_movie")]
        movie: Option<FavoriteRecord>,
        #[serde(default)]
        user_name: Option<String>,
    },
    FavoriteMovie {
        movie: FavoriteRecord,
        #[serde(default)]
        user_name: Option<String>,
    },
}

fn lenient_movie<'de, D>(deserializer: D) -> Result<Option<FavoriteRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

impl InboundEvent {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for non-JSON text, a missing or unknown `type` tag, or
    /// a payload that does not match its tag.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingType)?
            .to_owned();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(EventError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|source| EventError::InvalidPayload { kind, source })
    }

    /// Wire tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::FavoriteConfirmed { .. } => "favorite_confirmed",
            Self::NewFavorite { .. } => "new_favorite",
            Self::FavoriteMovie { .. } => "favorite_movie",
        }
    }

    /// Text to show for whitelisted notification types, `None` otherwise.
    #[must_use]
    pub fn display_message(&self) -> Option<&str> {
        match self {
            Self::ConnectionEstablished { message }
            | Self::FavoriteConfirmed { message, .. }
            | Self::NewFavorite { message, .. } => Some(message),
            Self::Ping { .. } | Self::FavoriteMovie { .. } => None,
        }
    }

    #[must_use]
    pub fn is_displayable(&self) -> bool {
        DISPLAY_TYPES.contains(&self.kind())
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Client-originated frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Heartbeat sent once right after the transport opens.
    Ping { timestamp: i64 },
    /// Best-effort broadcast after a favorite was stored.
    FavoriteMovie { movie: FavoriteRecord, user_name: String },
}

impl OutboundEvent {
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Ping { timestamp: now_ms() }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::FavoriteMovie { .. } => "favorite_movie",
        }
    }

    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Wall-clock epoch milliseconds, `0` if the clock is before the epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
