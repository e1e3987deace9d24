//! Synthetic traffic generator
//!
//! Emits plausible request records with occasional injected anomaly episodes,
//! useful for demos and for exercising the detectors without a real upstream.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::health::{components, HealthRegistry};
use crate::models::RawRecord;
use crate::pipeline::PipelineHandle;

use super::{default_series, RecordSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_series")]
    pub series: String,
    #[serde(default = "default_events_per_second")]
    pub events_per_second: f64,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Chance per record of starting an anomaly episode
    #[serde(default = "default_anomaly_probability")]
    pub anomaly_probability: f64,
    /// Records per anomaly episode
    #[serde(default = "default_episode_length")]
    pub episode_length: u32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_events_per_second() -> f64 {
    10.0
}

fn default_endpoints() -> Vec<String> {
    ["/api/users", "/api/orders", "/api/search", "/health"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_anomaly_probability() -> f64 {
    0.01
}

fn default_episode_length() -> u32 {
    20
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            series: default_series(),
            events_per_second: default_events_per_second(),
            endpoints: default_endpoints(),
            anomaly_probability: default_anomaly_probability(),
            episode_length: default_episode_length(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Episode {
    LatencySpike,
    CpuSpike,
    MemoryLeak,
    ServerErrors,
    /// Traffic stops; no records are produced
    Drop,
}

const EPISODES: [Episode; 5] = [
    Episode::LatencySpike,
    Episode::CpuSpike,
    Episode::MemoryLeak,
    Episode::ServerErrors,
    Episode::Drop,
];

/// Deterministic record generator; the async source wraps one of these
pub struct SyntheticGenerator {
    config: SyntheticConfig,
    rng: StdRng,
    episode: Option<(Episode, u32)>,
    leaked_mem: f64,
}

impl SyntheticGenerator {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            episode: None,
            leaked_mem: 0.0,
        }
    }

    pub fn episode(&self) -> Option<Episode> {
        self.episode.map(|(e, _)| e)
    }

    /// Force an episode, mostly for tests
    pub fn start_episode(&mut self, episode: Episode) {
        self.episode = Some((episode, self.config.episode_length.max(1)));
        self.leaked_mem = 0.0;
    }

    /// Next record at `now`, or `None` while traffic is dropped
    pub fn next_record(&mut self, now: DateTime<Utc>) -> Option<RawRecord> {
        let probability = self.config.anomaly_probability.clamp(0.0, 1.0);
        if self.episode.is_none() && self.rng.gen_bool(probability) {
            let episode = *EPISODES
                .choose(&mut self.rng)
                .unwrap_or(&Episode::LatencySpike);
            debug!(episode = ?episode, "Injecting synthetic anomaly");
            self.start_episode(episode);
        }

        let current = self.episode.map(|(e, _)| e);
        if let Some((_, remaining)) = self.episode.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.episode = None;
            }
        }
        if current == Some(Episode::Drop) {
            return None;
        }

        let mut response_time = self.rng.gen_range(80.0..160.0);
        let mut cpu = self.rng.gen_range(25.0..45.0);
        let mut mem = self.rng.gen_range(45.0..55.0);
        let mut status = if self.rng.gen_bool(0.01) { 404 } else { 200 };

        match current {
            Some(Episode::LatencySpike) => response_time *= self.rng.gen_range(4.0..8.0),
            Some(Episode::CpuSpike) => cpu = self.rng.gen_range(92.0..99.0),
            Some(Episode::MemoryLeak) => {
                self.leaked_mem += 4.0;
                mem = (mem + self.leaked_mem).min(99.0);
            }
            Some(Episode::ServerErrors) => {
                status = *[500, 502, 503].choose(&mut self.rng).unwrap_or(&500)
            }
            Some(Episode::Drop) | None => {}
        }

        let endpoint = self
            .config
            .endpoints
            .choose(&mut self.rng)
            .cloned()
            .unwrap_or_else(|| "/".to_string());
        let client = format!(
            "10.0.{}.{}",
            self.rng.gen_range(0..4),
            self.rng.gen_range(1..255)
        );

        let mut record = Map::new();
        record.insert("timestamp".into(), Value::String(now.to_rfc3339()));
        record.insert("source_id".into(), Value::String(self.config.series.clone()));
        record.insert("status_code".into(), json!(status));
        record.insert("response_time_ms".into(), json!(round2(response_time)));
        record.insert("cpu_pct".into(), json!(round2(cpu)));
        record.insert("mem_pct".into(), json!(round2(mem)));
        record.insert("endpoint".into(), Value::String(endpoint));
        record.insert("client_addr".into(), Value::String(client));
        Some(record)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    fn period(&self) -> Duration {
        let eps = self.config.events_per_second;
        if eps.is_finite() && eps > 0.0 {
            Duration::from_secs_f64(1.0 / eps)
        } else {
            Duration::from_secs(1)
        }
    }
}

#[async_trait]
impl RecordSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn run(
        self: Box<Self>,
        sink: PipelineHandle,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            series = %self.config.series,
            events_per_second = self.config.events_per_second,
            "Starting synthetic source"
        );
        health.set_healthy(components::INGEST).await;

        let mut ticker = interval(self.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let series = self.config.series.clone();
        let mut generator = SyntheticGenerator::new(self.config);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(record) = generator.next_record(Utc::now()) {
                        sink.submit(series.as_str(), record);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down synthetic source");
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

    fn quiet(seed: u64) -> SyntheticConfig {
        SyntheticConfig {
            anomaly_probability: 0.0,
            episode_length: 5,
            seed: Some(seed),
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn test_seeded_generator_is_reproducible() {
        let now = Utc::now();
        let mut a = SyntheticGenerator::new(quiet(3));
        let mut b = SyntheticGenerator::new(quiet(3));
        for _ in 0..20 {
            assert_eq!(a.next_record(now), b.next_record(now));
        }
    }

    #[test]
    fn test_normal_records_look_healthy() {
        let mut generator = SyntheticGenerator::new(quiet(11));
        for _ in 0..100 {
            let record = generator.next_record(Utc::now()).unwrap();
            let status = record["status_code"].as_u64().unwrap();
            assert!(status == 200 || status == 404);
            let cpu = record["cpu_pct"].as_f64().unwrap();
            assert!((25.0..=45.0).contains(&cpu));
            assert!(record["endpoint"].as_str().unwrap().starts_with('/'));
        }
    }

    #[test]
    fn test_server_error_episode() {
        let mut generator = SyntheticGenerator::new(quiet(5));
        generator.start_episode(Episode::ServerErrors);
        for _ in 0..5 {
            let record = generator.next_record(Utc::now()).unwrap();
            assert!(record["status_code"].as_u64().unwrap() >= 500);
        }
        assert_eq!(generator.episode(), None);
    }

    #[test]
    fn test_drop_episode_emits_nothing() {
        let mut generator = SyntheticGenerator::new(quiet(5));
        generator.start_episode(Episode::Drop);
        let produced = (0..5)
            .filter_map(|_| generator.next_record(Utc::now()))
            .count();
        assert_eq!(produced, 0);
        assert!(generator.next_record(Utc::now()).is_some());
    }

    #[test]
    fn test_memory_leak_climbs() {
        let mut generator = SyntheticGenerator::new(quiet(9));
        generator.start_episode(Episode::MemoryLeak);
        let mem: Vec<f64> = (0..5)
            .map(|_| generator.next_record(Utc::now()).unwrap()["mem_pct"].as_f64().unwrap())
            .collect();
        assert!(mem[4] > mem[0]);
    }

    #[tokio::test]
    async fn test_source_submits_until_shutdown() {
        let (sink, mut rx) = PipelineHandle::detached();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let source = Box::new(SyntheticSource::new(SyntheticConfig {
            events_per_second: 200.0,
            ..quiet(1)
        }));
        let task = tokio::spawn(source.run(sink, HealthRegistry::new(), shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.series_key, "default");
        assert!(first.raw.contains_key("response_time_ms"));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
