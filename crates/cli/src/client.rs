//! API client for the Streamwatch agent

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("API error ({status}): {message}")]
    Api { status: StatusCode, message: String },
}

/// API client for the agent's read API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// GET `path` with optional query parameters
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.get(url).query(query)).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.post(url)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.delete(url).query(query)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ClientError::Api { status, message }.into());
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn active_alerts(&self) -> Result<Vec<AlertView>> {
        self.get("api/v1/alerts/active", &[]).await
    }

    pub async fn alert_history(&self, since: &str) -> Result<Vec<AlertEventView>> {
        self.get("api/v1/alerts/history", &[("since", since)]).await
    }

    pub async fn recent_alerts(
        &self,
        limit: usize,
        severity: Option<&str>,
    ) -> Result<Vec<AlertEventView>> {
        let limit = limit.to_string();
        let mut query = vec![("limit", limit.as_str())];
        query.extend(severity.map(|s| ("severity", s)));
        self.get("api/v1/alerts/recent", &query).await
    }

    pub async fn acknowledge(&self, id: &str) -> Result<AlertView> {
        self.post(&format!("api/v1/alerts/{id}/ack")).await
    }

    pub async fn clear_alerts(&self, severity: Option<&str>) -> Result<ClearedView> {
        let query: Vec<(&str, &str)> = severity.map(|s| ("severity", s)).into_iter().collect();
        self.delete("api/v1/alerts", &query).await
    }

    pub async fn series(&self) -> Result<Vec<SeriesView>> {
        self.get("api/v1/series", &[]).await
    }

    pub async fn features(&self, series: &str) -> Result<FeatureView> {
        let path = format!("api/v1/series/{series}/features");
        self.get(&path, &[]).await
    }

    pub async fn status(&self) -> Result<StatusView> {
        self.get("api/v1/status", &[]).await
    }

    /// Health is served with 503 when unhealthy, which is still a valid answer
    pub async fn health(&self) -> Result<HealthView> {
        let url = self.base_url.join("healthz").context("Invalid path")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        response.json().await.context("Failed to parse health response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertView {
    pub id: String,
    pub series_key: String,
    pub kind: String,
    pub source_id: String,
    pub severity: String,
    pub score: f64,
    pub detector_name: String,
    pub detail: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u32,
    pub state: String,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEventView {
    pub transition: String,
    pub emitted_at: DateTime<Utc>,
    pub alert: AlertView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesView {
    pub series_key: String,
    pub size: usize,
    pub capacity: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub total_appended: u64,
    pub total_evicted: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampledView {
    Ready(f64),
    Insufficient { have: usize, need: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldStatsView {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
    pub baseline_mean: Option<f64>,
    pub recent_mean: Option<f64>,
    pub ema: f64,
    pub spike_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureView {
    pub series_key: String,
    pub timestamp: DateTime<Utc>,
    pub sample_count: usize,
    pub baseline_count: usize,
    pub recent_count: usize,
    pub rps_recent: SampledView,
    pub rps_baseline: SampledView,
    pub error_rate_recent: SampledView,
    pub error_rate_baseline: SampledView,
    pub response_time: Option<FieldStatsView>,
    pub cpu: Option<FieldStatsView>,
    pub mem: Option<FieldStatsView>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: usize,
    #[serde(default)]
    pub by_severity: BTreeMap<String, usize>,
    #[serde(default)]
    pub by_transition: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unacknowledged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearedView {
    pub active: usize,
    pub history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub instance: String,
    pub version: String,
    pub status: String,
    pub series: usize,
    pub active_alerts: usize,
    pub history: HistorySummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentView {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthView {
    pub status: String,
    pub components: BTreeMap<String, ComponentView>,
}
