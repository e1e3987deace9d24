//! Async driver for the pipeline
//!
//! A dispatcher routes submitted records to one worker task per series, so a
//! series is processed strictly in submission order while different series run
//! in parallel. A sweeper resolves quiet alerts and a retrainer refreshes the
//! isolation forests. All tasks stop on the shared broadcast shutdown signal;
//! a worker always finishes the tick it is in before exiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::{components, HealthRegistry};
use crate::models::RawRecord;

use super::{Pipeline, Retrainer};

pub(crate) struct Submission {
    pub(crate) series_key: String,
    pub(crate) raw: RawRecord,
}

/// Cheap, cloneable entry point for stream sources
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Submission>,
}

impl PipelineHandle {
    /// Queue one record; returns immediately
    pub fn submit(&self, series_key: impl Into<String>, raw: RawRecord) {
        let submission = Submission {
            series_key: series_key.into(),
            raw,
        };
        if self.tx.send(submission).is_err() {
            debug!("Pipeline stopped, dropping submitted record");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle whose submissions land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Submission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

pub struct PipelineRuntime {
    handle: PipelineHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineRuntime {
    /// Spawn the dispatcher, sweeper and retrainer
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        health: HealthRegistry,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sweep_every = Duration::from_secs(pipeline.config().alerts.sweep_interval_secs);

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(dispatch(
            pipeline.clone(),
            rx,
            health.clone(),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep(
            pipeline.clone(),
            sweep_every,
            shutdown.subscribe(),
        )));
        if pipeline.config().isolation_forest.enabled {
            let retrainer = Retrainer::new(pipeline, health);
            tasks.push(tokio::spawn(retrainer.run(shutdown.subscribe())));
        }

        Self {
            handle: PipelineHandle { tx },
            tasks,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Wait for every task to stop
    pub async fn join(self) {
        drop(self.handle);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
    }
}

async fn dispatch(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::UnboundedReceiver<Submission>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Starting pipeline dispatcher");
    health.set_healthy(components::PIPELINE).await;

    let mut routes: HashMap<String, mpsc::UnboundedSender<RawRecord>> = HashMap::new();
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            submission = rx.recv() => {
                let Some(Submission { series_key, raw }) = submission else {
                    debug!("All pipeline handles dropped");
                    break;
                };
                let route = routes.entry(series_key.clone()).or_insert_with(|| {
                    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
                    workers.spawn(work(
                        pipeline.clone(),
                        series_key.clone(),
                        worker_rx,
                        shutdown.resubscribe(),
                    ));
                    worker_tx
                });
                if route.send(raw).is_err() {
                    warn!(series = %series_key, "Series worker gone, dropping record");
                    routes.remove(&series_key);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down pipeline dispatcher");
                break;
            }
        }
    }

    // Closing the routes stops any worker that missed the signal
    routes.clear();
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Series worker ended abnormally");
        }
    }
    health
        .set_unhealthy(components::PIPELINE, "pipeline stopped")
        .await;
}

async fn work(
    pipeline: Arc<Pipeline>,
    series_key: String,
    mut rx: mpsc::UnboundedReceiver<RawRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(series = %series_key, "Starting series worker");
    loop {
        tokio::select! {
            raw = rx.recv() => {
                let Some(raw) = raw else { break };
                pipeline.process(&series_key, &raw);
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!(series = %series_key, "Series worker stopped");
}

async fn sweep(pipeline: Arc<Pipeline>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resolved = pipeline.sweep(Utc::now());
                if !resolved.is_empty() {
                    debug!(count = resolved.len(), "Resolved quiet alerts");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
