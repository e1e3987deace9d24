//! The streaming detection pipeline
//!
//! [`Pipeline`] is the synchronous core: it owns an arena of per-series state
//! keyed by series name and advances one series by one record per call.
//! [`runtime::PipelineRuntime`] drives it from async tasks with one worker
//! per series, a periodic sweeper and a background model retrainer.

mod series;
pub mod retrain;
pub mod runtime;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::alert::{AlertHistory, HistoryStats};
use crate::anomaly::{IsolationForest, ModelSlot};
use crate::config::PipelineConfig;
use crate::error::{DetectError, Result};
use crate::models::{Alert, AlertEvent, AlertTransition, FeatureVector, RawRecord, Severity};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::processing::WindowStats;

use series::SeriesState;

pub use retrain::Retrainer;
pub use runtime::{PipelineHandle, PipelineRuntime};
pub use series::TickReport;

/// What [`Pipeline::clear_alerts`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearedAlerts {
    pub active: usize,
    pub history: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    series: DashMap<String, Arc<Mutex<SeriesState>>>,
    models: DashMap<String, Arc<ModelSlot>>,
    history: AlertHistory,
    events_tx: broadcast::Sender<AlertEvent>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    /// This pipeline's share of the active-alerts gauge
    active_count: AtomicI64,
}

impl Pipeline {
    /// Build a pipeline; invalid configuration is rejected before any record
    pub fn new(config: PipelineConfig, logger: StructuredLogger) -> Result<Self> {
        config.validate()?;
        let (events_tx, _) = broadcast::channel(config.alerts.channel_capacity);
        Ok(Self {
            history: AlertHistory::new(&config.alerts),
            config,
            series: DashMap::new(),
            models: DashMap::new(),
            events_tx,
            metrics: PipelineMetrics::new(),
            logger,
            active_count: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    fn state(&self, series_key: &str) -> Arc<Mutex<SeriesState>> {
        if let Some(state) = self.series.get(series_key) {
            return state.clone();
        }
        let state = self
            .series
            .entry(series_key.to_string())
            .or_insert_with(|| {
                let slot = Arc::new(ModelSlot::new(self.config.isolation_forest.history_size));
                self.models.insert(series_key.to_string(), slot.clone());
                debug!(series = %series_key, "Tracking new series");
                Arc::new(Mutex::new(SeriesState::new(
                    series_key,
                    &self.config,
                    slot,
                    self.metrics.clone(),
                    self.logger.clone(),
                )))
            })
            .clone();
        self.metrics.set_series_tracked(self.series.len());
        state
    }

    /// Run one record through the pipeline for `series_key`
    pub fn process(&self, series_key: &str, raw: &RawRecord) -> TickReport {
        self.process_at(series_key, raw, Utc::now())
    }

    /// As [`Pipeline::process`], with `now` standing in for a missing timestamp
    pub fn process_at(&self, series_key: &str, raw: &RawRecord, now: DateTime<Utc>) -> TickReport {
        let started = Instant::now();
        let state = self.state(series_key);
        let report = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.tick(raw, now)
        };

        if !report.malformed.is_empty() {
            self.metrics.inc_malformed(report.malformed.len() as u64);
            for issue in &report.malformed {
                if let DetectError::MalformedRecord { field, reason } = issue {
                    self.logger.log_malformed_field(series_key, field, reason);
                }
            }
        }
        self.publish(&report.events);
        self.metrics.observe_tick(started.elapsed().as_secs_f64());
        report
    }

    /// Resolve quiet alerts across every series
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for state in self.states() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            events.extend(state.sweep(now));
        }
        self.publish(&events);
        events
    }

    fn publish(&self, events: &[AlertEvent]) {
        for event in events {
            match event.transition {
                AlertTransition::Raised => self.adjust_active(1),
                AlertTransition::Resolved => self.adjust_active(-1),
                _ => {}
            }
            self.metrics
                .inc_alert_event(event.transition, event.alert.severity);
            self.logger.log_alert(event);
            self.history.record(event.clone());
            // No subscribers is fine
            let _ = self.events_tx.send(event.clone());
        }
    }

    fn adjust_active(&self, delta: i64) {
        self.active_count.fetch_add(delta, Ordering::Relaxed);
        self.metrics.add_active_alerts(delta);
    }

    /// Active alerts as counted into the `streamwatch_active_alerts` gauge
    pub fn tracked_active_alerts(&self) -> i64 {
        self.active_count.load(Ordering::Relaxed)
    }

    fn states(&self) -> Vec<Arc<Mutex<SeriesState>>> {
        self.series.iter().map(|e| e.value().clone()).collect()
    }

    /// Acknowledge an active alert by id
    ///
    /// The first acknowledgement is published as an event; repeating it just
    /// returns the alert. `None` when no active alert has this id.
    pub fn acknowledge(&self, id: Uuid, at: DateTime<Utc>) -> Option<Alert> {
        for state in self.states() {
            let event = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(already) = state.find_alert(id).map(|a| a.acknowledged) else {
                    continue;
                };
                if already {
                    return state.find_alert(id).cloned();
                }
                state.acknowledge(id, at)
            };
            let event = event?;
            self.publish(std::slice::from_ref(&event));
            return Some(event.alert);
        }
        None
    }

    /// Drop active alerts and history events of one severity, or all
    ///
    /// Cleared alerts vanish without a resolution event.
    pub fn clear_alerts(&self, severity: Option<Severity>) -> ClearedAlerts {
        let active: usize = self
            .states()
            .iter()
            .map(|state| {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.clear_alerts(severity).len()
            })
            .sum();
        self.adjust_active(-(active as i64));
        let history = self.history.clear(severity);
        self.logger.log_alerts_cleared(severity, active, history);
        ClearedAlerts { active, history }
    }

    /// Up to `limit` history events, newest first
    pub fn recent_alerts(&self, limit: usize, severity: Option<Severity>) -> Vec<AlertEvent> {
        self.history.recent(limit, severity)
    }

    pub fn latest_features(&self, series_key: &str) -> Option<FeatureVector> {
        let state = self.series.get(series_key)?.clone();
        let state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.latest_features().cloned()
    }

    /// Active alerts across all series, most severe first, then oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .states()
            .iter()
            .flat_map(|state| {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.active_alerts().cloned().collect::<Vec<_>>()
            })
            .collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        alerts
    }

    /// Alert events emitted at or after `since`, oldest first
    pub fn alert_history(&self, since: DateTime<Utc>) -> Vec<AlertEvent> {
        self.history.since(since)
    }

    pub fn history_stats(&self) -> HistoryStats {
        HistoryStats {
            unacknowledged: self
                .active_alerts()
                .iter()
                .filter(|a| !a.acknowledged)
                .count(),
            ..self.history.stats()
        }
    }

    /// Live stream of newly emitted alert events
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events_tx.subscribe()
    }

    pub fn series_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn window_stats(&self) -> Vec<WindowStats> {
        let mut stats: Vec<WindowStats> = self
            .series
            .iter()
            .map(|e| {
                let state = e.value().lock().unwrap_or_else(PoisonError::into_inner);
                state.window_stats()
            })
            .collect();
        stats.sort_by(|a, b| a.series_key.cmp(&b.series_key));
        stats
    }

    /// Drop all state for a series; returns whether it existed
    ///
    /// Its active alerts leave the active gauge with it.
    pub fn clear(&self, series_key: &str) -> bool {
        self.models.remove(series_key);
        let removed = self.series.remove(series_key);
        self.metrics.set_series_tracked(self.series.len());
        let Some((_, state)) = removed else {
            return false;
        };
        let active = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active_alerts()
            .count();
        self.adjust_active(-(active as i64));
        true
    }

    pub(crate) fn model_slots(&self) -> Vec<(String, Arc<ModelSlot>)> {
        self.models
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Synchronously fit and publish a model from the series' feature history
    pub fn train_model(&self, series_key: &str) -> Result<u64> {
        let need = self.config.isolation_forest.min_training_samples;
        let slot = self
            .models
            .get(series_key)
            .map(|e| e.value().clone())
            .ok_or_else(|| DetectError::insufficient(0, need))?;
        let history = slot.history_snapshot();
        let forest = IsolationForest::fit(&history, &self.config.isolation_forest)?;
        let threshold = forest.threshold();
        let version = slot.publish(forest);
        self.metrics.inc_model_training("published");
        self.logger
            .log_model_trained(series_key, version, history.len(), threshold);
        Ok(version)
    }
}
