//! Background isolation-forest retraining
//!
//! Fits run on the blocking pool and are published through each series'
//! [`ModelSlot`](crate::anomaly::ModelSlot); detection keeps scoring against
//! the previous model until the swap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::anomaly::IsolationForest;
use crate::health::{components, HealthRegistry};

use super::Pipeline;

pub struct Retrainer {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    health: HealthRegistry,
}

impl Retrainer {
    pub fn new(pipeline: Arc<Pipeline>, health: HealthRegistry) -> Self {
        let interval = Duration::from_secs(pipeline.config().isolation_forest.retrain_interval_secs);
        Self {
            pipeline,
            interval,
            health,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting model retrainer");
        self.health.register(components::MODEL_TRAINER).await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; nothing has history yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let published = self.retrain_all().await;
                    debug!(published, "Retrain pass finished");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down model retrainer");
                    break;
                }
            }
        }
    }

    /// One pass over every series with enough history; returns models published
    pub async fn retrain_all(&self) -> usize {
        let config = self.pipeline.config().isolation_forest.clone();
        let metrics = self.pipeline.metrics.clone();
        let logger = self.pipeline.logger().clone();
        let mut published = 0;
        let mut failures = Vec::new();

        for (series, slot) in self.pipeline.model_slots() {
            if slot.history_len() < config.min_training_samples {
                continue;
            }
            let history = slot.history_snapshot();
            let samples = history.len();
            let fit_config = config.clone();
            let fitted =
                tokio::task::spawn_blocking(move || IsolationForest::fit(&history, &fit_config))
                    .await;

            match fitted {
                Ok(Ok(forest)) => {
                    let threshold = forest.threshold();
                    let version = slot.publish(forest);
                    metrics.inc_model_training("published");
                    logger.log_model_trained(&series, version, samples, threshold);
                    published += 1;
                }
                Ok(Err(e)) => {
                    metrics.inc_model_training("failed");
                    logger.log_model_training_failed(&series, &e.to_string());
                    failures.push(series);
                }
                Err(e) => {
                    metrics.inc_model_training("failed");
                    logger.log_model_training_failed(&series, &e.to_string());
                    failures.push(series);
                }
            }
        }

        if failures.is_empty() {
            self.health.set_healthy(components::MODEL_TRAINER).await;
        } else {
            self.health
                .set_degraded(
                    components::MODEL_TRAINER,
                    format!("training failed for: {}", failures.join(", ")),
                )
                .await;
        }
        published
    }
}
