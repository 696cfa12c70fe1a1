//! Shared Provider HTTP Client
//!
//! Thin wrapper over reqwest used by every rail adapter: JSON in/out,
//! bearer auth, one timeout per rail. Transport failures and 5xx map to
//! UPSTREAM_UNAVAILABLE; 4xx map to a provider rejection with the body
//! preserved for the rail record.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::RailError;

pub struct RailHttpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RailHttpClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RailError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| RailError::Upstream(e.to_string()))?;

        Self::decode(response).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, RailError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RailError::Upstream(e.to_string()))?;

        Self::decode(response).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, RailError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RailError::Upstream(e.to_string()))?;

        if status.is_server_error() {
            return Err(RailError::Upstream(format!(
                "provider returned {}: {}",
                status, body
            )));
        }
        if status.is_client_error() {
            return Err(RailError::Rejected {
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            RailError::Upstream(format!("unparseable provider response: {e}: {body}"))
        })
    }
}
