//! Favorites REST client.
//!
//! Thin HTTP wrapper for `GET/POST/DELETE /api/favorites`. Body checks live in
//! the pure `parse_*` functions so they can be tested without a server.

use serde_json::Value;

use super::FavoritesError;
use crate::config::HttpTimeouts;
use crate::session::Credential;
use crate::types::FavoriteRecord;

const FAVORITES_PATH: &str = "/api/favorites";

/// Server-side favorites store, scoped by the bearer credential.
#[async_trait::async_trait]
pub trait FavoritesApi: Send + Sync {
    async fn list(&self, credential: &Credential) -> Result<Vec<FavoriteRecord>, FavoritesError>;
    async fn add(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError>;
    async fn remove(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError>;
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpFavoritesApi {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpFavoritesApi {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeouts: HttpTimeouts) -> Result<Self, FavoritesError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.request)
            .connect_timeout(timeouts.connect)
            .build()?;
        Ok(Self { http, endpoint: format!("{}{FAVORITES_PATH}", base_url.trim_end_matches('/')) })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, op: &'static str, request: reqwest::RequestBuilder) -> Result<String, FavoritesError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(FavoritesError::Status { op, status });
        }
        Ok(text)
    }

    async fn write(
        &self,
        op: &'static str,
        method: reqwest::Method,
        credential: &Credential,
        movie: &FavoriteRecord,
    ) -> Result<(), FavoritesError> {
        let request = self
            .http
            .request(method, &self.endpoint)
            .bearer_auth(credential.as_str())
            .json(&serde_json::json!({ "movie": movie }));
        let text = self.execute(op, request).await?;
        parse_ack(&text)
    }
}

#[async_trait::async_trait]
impl FavoritesApi for HttpFavoritesApi {
    async fn list(&self, credential: &Credential) -> Result<Vec<FavoriteRecord>, FavoritesError> {
        let request = self.http.get(&self.endpoint).bearer_auth(credential.as_str());
        let text = self.execute("list", request).await?;
        parse_list(&text)
    }

    async fn add(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        self.write("add", reqwest::Method::POST, credential, movie).await
    }

    async fn remove(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        self.write("remove", reqwest::Method::DELETE, credential, movie).await
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Reject bodies carrying the `{"Response":"False","Error":...}` marker.
fn check_marker(body: &Value) -> Result<(), FavoritesError> {
    if body.get("Response").and_then(Value::as_str) == Some("False") {
        let message = body.get("Error").and_then(Value::as_str).unwrap_or("request rejected");
        return Err(FavoritesError::Rejected(message.to_owned()));
    }
    Ok(())
}

pub(crate) fn parse_list(text: &str) -> Result<Vec<FavoriteRecord>, FavoritesError> {
    let mut body: Value = serde_json::from_str(text)?;
    check_marker(&body)?;
    let favorites = body
        .get_mut("favorites")
        .map(Value::take)
        .ok_or(FavoritesError::MissingField("favorites"))?;
    Ok(serde_json::from_value(favorites)?)
}

pub(crate) fn parse_ack(text: &str) -> Result<(), FavoritesError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let body: Value = serde_json::from_str(text)?;
    check_marker(&body)
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
