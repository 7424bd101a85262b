//! Client-side notification pipeline for the movie favorites service.
//!
//! A session opens one websocket to the notification endpoint. Inbound events
//! flow through the listener bridge into a FIFO queue, and the drainer shows
//! them one at a time. Favorites are cached from the REST service, updated
//! optimistically, and revalidated in the background.

pub mod app;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod drainer;
pub mod event;
pub mod favorites;
pub mod queue;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use app::{ClientError, NotificationClient};
