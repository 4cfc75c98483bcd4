use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::ApiConfig;
use crate::protocol::{CurrentMatch, DivisionScopedData, Tournament};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("Division {0} not found in tournament")]
    DivisionNotFound(String),
}

/// REST backend supplying snapshots on demand: scoped division data for
/// subscribe requests and the current match for fallback polling.
///
/// Trait object so the relay and connection manager can be exercised in
/// tests without a live backend.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// `GET /match/current` — the pairing context currently on air.
    async fn current_match(&self) -> Result<CurrentMatch, ApiError>;

    /// `GET /tournament/{id}` — full multi-division snapshot.
    async fn tournament(&self, user_id: i64, tournament_id: i64) -> Result<Tournament, ApiError>;

    /// `GET /tournament/{id}/division/{division_id}` — one division only.
    async fn tournament_division(
        &self,
        user_id: i64,
        tournament_id: i64,
        division_id: i64,
    ) -> Result<DivisionScopedData, ApiError>;
}

/// Production [`SnapshotApi`] over reqwest.
pub struct HttpSnapshotApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: String) -> Result<T, ApiError> {
        tracing::debug!(endpoint = %endpoint, "Fetching snapshot");

        let response = self.http.get(&endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                endpoint,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl SnapshotApi for HttpSnapshotApi {
    async fn current_match(&self) -> Result<CurrentMatch, ApiError> {
        self.get_json(format!("{}/match/current", self.base_url))
            .await
    }

    async fn tournament(&self, user_id: i64, tournament_id: i64) -> Result<Tournament, ApiError> {
        self.get_json(format!(
            "{}/tournament/{}?user={}",
            self.base_url, tournament_id, user_id
        ))
        .await
    }

    async fn tournament_division(
        &self,
        user_id: i64,
        tournament_id: i64,
        division_id: i64,
    ) -> Result<DivisionScopedData, ApiError> {
        self.get_json(format!(
            "{}/tournament/{}/division/{}?user={}",
            self.base_url, tournament_id, division_id, user_id
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed_from_base_url() {
        let api = HttpSnapshotApi::new(&ApiConfig {
            base_url: "http://localhost:3001/api/".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap();

        assert_eq!(api.base_url(), "http://localhost:3001/api");
    }
}
