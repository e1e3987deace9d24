//! WebSocket source: every text frame is one JSON record

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::health::{components, HealthRegistry};
use crate::pipeline::PipelineHandle;

use super::socket::{default_max_reconnect_secs, default_reconnect_secs};
use super::{default_series, parse_record, series_for, wait_or_shutdown, Backoff, RecordSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_series")]
    pub series: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_max_reconnect_secs")]
    pub max_reconnect_secs: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:9001/events".to_string()
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            series: default_series(),
            url: default_url(),
            reconnect_secs: default_reconnect_secs(),
            max_reconnect_secs: default_max_reconnect_secs(),
        }
    }
}

pub struct WebSocketSource {
    config: WebSocketConfig,
}

impl WebSocketSource {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Pump frames until the peer goes away; true means shutdown was requested
    async fn pump(
        &self,
        sink: &PipelineHandle,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        let (mut stream, _) = connect_async(self.config.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.config.url))?;
        info!(url = %self.config.url, "WebSocket connected");

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let Some(frame) = frame else { return Ok(false) };
                    match frame.context("websocket read failed")? {
                        Message::Text(text) => match parse_record(&text) {
                            Ok(raw) => {
                                let series = series_for(&raw, &self.config.series).to_string();
                                sink.submit(series, raw);
                            }
                            Err(e) => debug!(error = %e, "Skipping unparseable frame"),
                        },
                        Message::Close(_) => return Ok(false),
                        _ => {}
                    }
                }
                _ = shutdown.recv() => {
                    let _ = stream.close(None).await;
                    return Ok(true);
                }
            }
        }
    }
}

#[async_trait]
impl RecordSource for WebSocketSource {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn run(
        self: Box<Self>,
        sink: PipelineHandle,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.config.reconnect_secs, self.config.max_reconnect_secs);
        info!(url = %self.config.url, "Starting websocket source");
        health.set_healthy(components::INGEST).await;

        loop {
            match self.pump(&sink, &mut shutdown).await {
                Ok(true) => break,
                Ok(false) => {
                    backoff.reset();
                    warn!(url = %self.config.url, "WebSocket closed by peer");
                }
                Err(e) => warn!(url = %self.config.url, error = %e, "WebSocket error"),
            }

            let delay = backoff.next_delay();
            health
                .set_degraded(
                    components::INGEST,
                    format!("reconnecting in {}s (attempt {})", delay.as_secs(), backoff.attempts()),
                )
                .await;
            if !wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!("Shutting down websocket source");
        Ok(())
    }
}
