//! API client for the fleet agent control API

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// Responses the CLI treats differently from a generic failure
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("another update cycle is already running, try again later")]
    Busy,

    #[error("API error ({status}): {body}")]
    Status { status: StatusCode, body: String },
}

/// API client for the agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        // Cycles can take minutes; the agent holds the request until it finishes
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(900))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body }.into());
        }

        response.json().await.context("Failed to parse response")
    }

    /// Fetch a health endpoint whose body is meaningful for any status
    pub async fn get_status<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;
        let status = response.status();
        let body = response.json().await.context("Failed to parse response")?;
        Ok((status, body))
    }

    /// Trigger a cycle. Aborted cycles still carry a result body.
    pub async fn run_cycle(&self, path: &str, query: &CycleQuery) -> Result<CycleSummary> {
        let response = self
            .client
            .post(self.url(path)?)
            .query(&query.pairs())
            .send()
            .await
            .context("Failed to send request")?;

        match response.status() {
            StatusCode::OK | StatusCode::INTERNAL_SERVER_ERROR => {
                response.json().await.context("Failed to parse cycle result")
            }
            StatusCode::CONFLICT => Err(ApiError::Busy.into()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Status { status, body }.into())
            }
        }
    }
}

/// Comma separated selectors sent with a cycle request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleQuery {
    pub images: Vec<String>,
    pub names: Vec<String>,
}

impl CycleQuery {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.images.is_empty() {
            pairs.push(("images", self.images.join(",")));
        }
        if !self.names.is_empty() {
            pairs.push(("names", self.names.join(",")));
        }
        pairs
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerError {
    pub container: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub container: String,
    pub action: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub kind: String,
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default)]
    pub errors: Vec<ContainerError>,
    #[serde(default)]
    pub stale: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub name: String,
    pub id: String,
    pub image: String,
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub is_self: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
