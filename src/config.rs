//! Client configuration parsed from environment variables.

use std::time::Duration;

use crate::connection::{
    ConnectionOptions, DEFAULT_CREDENTIAL_PARAM, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS,
    ReconnectPolicy,
};
use crate::drainer::{DEFAULT_DWELL_MS, DEFAULT_FADE_MS, DrainTiming};
use crate::favorites::DEFAULT_REFETCH_SECS;
use crate::session::DEFAULT_CREDENTIAL_REFRESH_SECS;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SOCKET_BASE_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 900;
pub const DEFAULT_HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a {expected} URL, got `{value}`")]
    InvalidUrl { var: &'static str, expected: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(DEFAULT_HTTP_REQUEST_TIMEOUT_SECS),
            connect: Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub socket_base_url: String,
    pub credential_param: String,
    pub timing: DrainTiming,
    pub favorites_refetch: Duration,
    pub credential_refresh: Duration,
    pub credential_ttl: Duration,
    pub reconnect: ReconnectPolicy,
    pub http: HttpTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            socket_base_url: DEFAULT_SOCKET_BASE_URL.to_owned(),
            credential_param: DEFAULT_CREDENTIAL_PARAM.to_owned(),
            timing: DrainTiming::default(),
            favorites_refetch: Duration::from_secs(DEFAULT_REFETCH_SECS),
            credential_refresh: Duration::from_secs(DEFAULT_CREDENTIAL_REFRESH_SECS),
            credential_ttl: Duration::from_secs(DEFAULT_CREDENTIAL_TTL_SECS),
            reconnect: ReconnectPolicy::default(),
            http: HttpTimeouts::default(),
        }
    }
}

impl ClientConfig {
    /// Build typed config from `REELCAST_*` environment variables.
    ///
    /// Optional:
    /// - `REELCAST_API_BASE_URL`: favorites REST base, default `http://127.0.0.1:8000`
    /// - `REELCAST_SOCKET_BASE_URL`: notification base, default `ws://127.0.0.1:8000/ws`
    /// - `REELCAST_SOCKET_CREDENTIAL_PARAM`: default `credential`
    /// - `REELCAST_DWELL_MS` / `REELCAST_FADE_MS`: default 3700 / 300
    /// - `REELCAST_FAVORITES_REFETCH_SECS`: default 60
    /// - `REELCAST_CREDENTIAL_REFRESH_SECS` / `REELCAST_CREDENTIAL_TTL_SECS`: default 600 / 900
    /// - `REELCAST_RECONNECT`: default false
    /// - `REELCAST_RECONNECT_MAX_ATTEMPTS` / `REELCAST_RECONNECT_DELAY_MS`: default 5 / 3000
    /// - `REELCAST_HTTP_REQUEST_TIMEOUT_SECS` / `REELCAST_HTTP_CONNECT_TIMEOUT_SECS`: default 30 / 10
    ///
    /// # Errors
    ///
    /// Returns an error if a base URL has the wrong scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] over an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a base URL has the wrong scheme.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_u64 = |key: &str, default: u64| env_parse(&lookup, key, default);

        let api_base_url = base_url(&lookup, "REELCAST_API_BASE_URL", DEFAULT_API_BASE_URL, &["http", "https"])?;
        let socket_base_url =
            base_url(&lookup, "REELCAST_SOCKET_BASE_URL", DEFAULT_SOCKET_BASE_URL, &["ws", "wss"])?;
        let credential_param = lookup("REELCAST_SOCKET_CREDENTIAL_PARAM")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CREDENTIAL_PARAM.to_owned());

        let timing = DrainTiming {
            dwell: Duration::from_millis(parse_u64("REELCAST_DWELL_MS", DEFAULT_DWELL_MS)),
            fade: Duration::from_millis(parse_u64("REELCAST_FADE_MS", DEFAULT_FADE_MS)),
        };
        let reconnect = ReconnectPolicy {
            enabled: env_parse(&lookup, "REELCAST_RECONNECT", false),
            max_attempts: env_parse(&lookup, "REELCAST_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS),
            delay: Duration::from_millis(parse_u64("REELCAST_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)),
        };
        let http = HttpTimeouts {
            request: Duration::from_secs(parse_u64(
                "REELCAST_HTTP_REQUEST_TIMEOUT_SECS",
                DEFAULT_HTTP_REQUEST_TIMEOUT_SECS,
            )),
            connect: Duration::from_secs(parse_u64(
                "REELCAST_HTTP_CONNECT_TIMEOUT_SECS",
                DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            )),
        };

        Ok(Self {
            api_base_url,
            socket_base_url,
            credential_param,
            timing,
            favorites_refetch: Duration::from_secs(parse_u64("REELCAST_FAVORITES_REFETCH_SECS", DEFAULT_REFETCH_SECS)),
            credential_refresh: Duration::from_secs(parse_u64(
                "REELCAST_CREDENTIAL_REFRESH_SECS",
                DEFAULT_CREDENTIAL_REFRESH_SECS,
            )),
            credential_ttl: Duration::from_secs(parse_u64("REELCAST_CREDENTIAL_TTL_SECS", DEFAULT_CREDENTIAL_TTL_SECS)),
            reconnect,
            http,
        })
    }

    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            socket_base_url: self.socket_base_url.clone(),
            credential_param: self.credential_param.clone(),
            reconnect: self.reconnect,
        }
    }
}

pub(crate) fn env_parse<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

fn base_url(
    lookup: impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: &str,
    schemes: &[&'static str],
) -> Result<String, ConfigError> {
    let value = lookup(var).unwrap_or_else(|| default.to_owned());
    let value = value.trim().trim_end_matches('/').to_owned();
    let scheme_ok = value
        .split_once("://")
        .is_some_and(|(scheme, rest)| schemes.contains(&scheme) && !rest.is_empty());
    if !scheme_ok {
        return Err(ConfigError::InvalidUrl { var, expected: schemes.join("/"), value });
    }
    Ok(value)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
