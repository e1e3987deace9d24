//! Stream sources that feed records into the pipeline
//!
//! Each source owns its I/O and reconnect policy and hands parsed records to a
//! [`PipelineHandle`]. Nothing here blocks the detection core: a slow or dead
//! upstream only ever delays the source's own task.

pub mod http;
pub mod socket;
pub mod synthetic;
pub mod websocket;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::health::HealthRegistry;
use crate::models::RawRecord;
use crate::pipeline::PipelineHandle;
use crate::processing::SERIES_KEY;

pub use http::{HttpProbeConfig, HttpProbeSource};
pub use socket::{SocketConfig, SocketSource};
pub use synthetic::{SyntheticConfig, SyntheticGenerator, SyntheticSource};
pub use websocket::{WebSocketConfig, WebSocketSource};

#[async_trait]
pub trait RecordSource: Send {
    /// Short name used in logs and health messages
    fn name(&self) -> &'static str;

    /// Produce records until shutdown
    async fn run(
        self: Box<Self>,
        sink: PipelineHandle,
        health: HealthRegistry,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()>;
}

/// Which source the agent runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SourceConfig {
    Synthetic(SyntheticConfig),
    Http(HttpProbeConfig),
    Socket(SocketConfig),
    Websocket(WebSocketConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic(SyntheticConfig::default())
    }
}

impl SourceConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            SourceConfig::Synthetic(_) => "synthetic",
            SourceConfig::Http(_) => "http",
            SourceConfig::Socket(_) => "socket",
            SourceConfig::Websocket(_) => "websocket",
        }
    }

    pub fn build(&self) -> Box<dyn RecordSource> {
        match self {
            SourceConfig::Synthetic(c) => Box::new(SyntheticSource::new(c.clone())),
            SourceConfig::Http(c) => Box::new(HttpProbeSource::new(c.clone())),
            SourceConfig::Socket(c) => Box::new(SocketSource::new(c.clone())),
            SourceConfig::Websocket(c) => Box::new(WebSocketSource::new(c.clone())),
        }
    }
}

fn default_series() -> String {
    "default".to_string()
}

/// Parse one JSON object record from a line or frame of text
pub fn parse_record(text: &str) -> Result<RawRecord> {
    let value: Value = serde_json::from_str(text.trim()).context("record is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, got {}", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Series named by the record's `series` key, else `default_series`
pub fn series_for<'a>(raw: &'a RawRecord, default_series: &'a str) -> &'a str {
    match raw.get(SERIES_KEY) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim(),
        _ => default_series,
    }
}

/// Exponential reconnect delay, doubling from `initial` up to `max`
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(initial_secs: u64, max_secs: u64) -> Self {
        let initial = Duration::from_secs(initial_secs.max(1));
        Self {
            initial,
            max: Duration::from_secs(max_secs).max(initial),
            attempt: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Sleep for `delay`; false if shutdown arrived first
pub(crate) async fn wait_or_shutdown(
    delay: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.recv() => false,
    }
}
