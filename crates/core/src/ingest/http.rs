//! HTTP probe source
//!
//! Polls a fixed list of URLs and turns each probe into a record carrying the
//! status code and the measured response time.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::{components, HealthRegistry};
use crate::models::RawRecord;
use crate::pipeline::PipelineHandle;

use super::{default_series, RecordSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProbeConfig {
    #[serde(default = "default_series")]
    pub series: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    5
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            series: default_series(),
            urls: Vec::new(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct HttpProbeSource {
    config: HttpProbeConfig,
}

impl HttpProbeSource {
    pub fn new(config: HttpProbeConfig) -> Self {
        Self { config }
    }

    fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP probe client")
    }
}

/// Probe `url` once; failures become a record with a `probe_error` extra
pub async fn probe(client: &reqwest::Client, url: &str) -> RawRecord {
    let started = Instant::now();
    let result = client.get(url).send().await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut record = Map::new();
    record.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
    record.insert("source_id".into(), Value::String(url.to_string()));
    record.insert("endpoint".into(), Value::String(url.to_string()));
    match result {
        Ok(response) => {
            record.insert("status_code".into(), json!(response.status().as_u16()));
            record.insert("response_time_ms".into(), json!(elapsed_ms));
        }
        Err(e) => {
            debug!(url = %url, error = %e, "Probe failed");
            record.insert("probe_error".into(), Value::String(e.to_string()));
        }
    }
    record
}

#[async_trait]
impl RecordSource for HttpProbeSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(
        self: Box<Self>,
        sink: PipelineHandle,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        if self.config.urls.is_empty() {
            health
                .set_unhealthy(components::INGEST, "no probe URLs configured")
                .await;
            anyhow::bail!("http source needs at least one URL");
        }
        let client = self.client()?;
        info!(
            urls = self.config.urls.len(),
            interval_secs = self.config.interval_secs,
            "Starting HTTP probe source"
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut failures = 0;
                    for url in &self.config.urls {
                        let record = probe(&client, url).await;
                        if record.contains_key("probe_error") {
                            failures += 1;
                        }
                        sink.submit(self.config.series.as_str(), record);
                    }
                    if failures == self.config.urls.len() {
                        warn!(failures, "Every probe failed this round");
                        health.set_degraded(components::INGEST, "all probes failing").await;
                    } else {
                        health.set_healthy(components::INGEST).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down HTTP probe source");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;

    #[tokio::test]
    async fn test_probe_records_status_and_latency() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ready")
            .with_status(503)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/ready", server.url());
        let record = probe(&client, &url).await;

        mock.assert_async().await;
        assert_eq!(record["status_code"], json!(503));
        assert!(record["response_time_ms"].as_f64().unwrap() >= 0.0);
        assert_eq!(record["source_id"], json!(url));
        assert!(!record.contains_key("probe_error"));
    }

    #[tokio::test]
    async fn test_unreachable_probe_has_no_metrics() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let record = probe(&client, "http://127.0.0.1:1/nothing").await;
        assert!(record.contains_key("probe_error"));
        assert!(!record.contains_key("status_code"));
        assert!(!record.contains_key("response_time_ms"));
    }

    #[tokio::test]
    async fn test_source_submits_one_record_per_url() {
        let mut server = mockito::Server::new_async().await;
        let _a = server.mock("GET", "/a").with_status(200).create_async().await;
        let _b = server.mock("GET", "/b").with_status(200).create_async().await;

        let (sink, mut rx) = PipelineHandle::detached();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let health = HealthRegistry::new();
        let source = Box::new(HttpProbeSource::new(HttpProbeConfig {
            series: "probes".to_string(),
            urls: vec![format!("{}/a", server.url()), format!("{}/b", server.url())],
            ..HttpProbeConfig::default()
        }));
        let task = tokio::spawn(source.run(sink, health.clone(), shutdown_rx));

        for _ in 0..2 {
            let submission = rx.recv().await.unwrap();
            assert_eq!(submission.series_key, "probes");
            assert_eq!(submission.raw["status_code"], json!(200));
        }

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        let status = health.health().await.components[components::INGEST].status;
        assert_eq!(status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_empty_url_list_fails_fast() {
        let (sink, _rx) = PipelineHandle::detached();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let source = Box::new(HttpProbeSource::new(HttpProbeConfig::default()));
        assert!(source
            .run(sink, HealthRegistry::new(), shutdown_rx)
            .await
            .is_err());
    }
}
