//! State owned by one series
//!
//! Everything a tick mutates lives here, behind one lock per series, so a
//! series is only ever advanced by one thread of control at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alert::AlertManager;
use crate::anomaly::{DetectionContext, DetectorManager, ModelSlot};
use crate::config::PipelineConfig;
use crate::error::DetectError;
use crate::feature::FeatureEngine;
use crate::models::{
    Alert, AlertEvent, EventRecord, FeatureVector, Finding, RawRecord, Severity,
};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::processing::{Preprocessor, Window, WindowStats};

/// Everything one tick produced
#[derive(Debug, Clone)]
pub struct TickReport {
    pub series_key: String,
    pub record: EventRecord,
    pub features: FeatureVector,
    pub findings: Vec<Finding>,
    pub events: Vec<AlertEvent>,
    pub malformed: Vec<DetectError>,
}

pub(crate) struct SeriesState {
    key: String,
    preprocessor: Preprocessor,
    window: Window,
    features: FeatureEngine,
    detectors: DetectorManager,
    alerts: AlertManager,
    latest: Option<FeatureVector>,
}

impl SeriesState {
    pub(crate) fn new(
        key: &str,
        config: &PipelineConfig,
        model: Arc<ModelSlot>,
        metrics: PipelineMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            key: key.to_string(),
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            window: Window::new(&config.window),
            features: FeatureEngine::new(config.features.clone()),
            detectors: DetectorManager::standard(config, model, metrics, logger),
            alerts: AlertManager::new(&config.alerts),
            latest: None,
        }
    }

    /// Preprocess -> window -> features -> detectors -> alerts, in one pass
    pub(crate) fn tick(&mut self, raw: &RawRecord, now: DateTime<Utc>) -> TickReport {
        let cleaned = self.preprocessor.clean(raw, &self.key, now);
        let record = self.window.append(cleaned.record);
        let snapshot = self.window.snapshot();
        let features = self.features.compute(&self.key, &snapshot);

        let ctx = DetectionContext {
            series_key: &self.key,
            record: &record,
            features: &features,
            window: &snapshot,
        };
        let findings = self.detectors.run(&ctx);
        let events = self.alerts.ingest(findings.clone(), now);

        self.latest = Some(features.clone());
        TickReport {
            series_key: self.key.clone(),
            record,
            features,
            findings,
            events,
            malformed: cleaned.issues,
        }
    }

    pub(crate) fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        self.alerts.sweep(now)
    }

    pub(crate) fn find_alert(&self, id: Uuid) -> Option<&Alert> {
        self.alerts.find(id)
    }

    pub(crate) fn acknowledge(&mut self, id: Uuid, at: DateTime<Utc>) -> Option<AlertEvent> {
        self.alerts.acknowledge(id, at)
    }

    pub(crate) fn clear_alerts(&mut self, severity: Option<Severity>) -> Vec<Alert> {
        self.alerts.clear(severity)
    }

    pub(crate) fn latest_features(&self) -> Option<&FeatureVector> {
        self.latest.as_ref()
    }

    pub(crate) fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.active()
    }

    pub(crate) fn window_stats(&self) -> WindowStats {
        self.window.stats(&self.key)
    }
}
