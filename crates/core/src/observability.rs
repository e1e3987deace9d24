//! Observability infrastructure for the detection pipeline
//!
//! Provides:
//! - Prometheus metrics (tick latency, findings, detector failures, alert events)
//! - Structured event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::models::{AlertEvent, AlertTransition, Severity};

/// Histogram buckets for per-tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    records_processed: IntCounter,
    malformed_fields: IntCounter,
    tick_latency_seconds: Histogram,
    findings: IntCounterVec,
    detector_failures: IntCounterVec,
    alert_events: IntCounterVec,
    series_tracked: IntGauge,
    active_alerts: IntGauge,
    model_trainings: IntCounterVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            records_processed: register_int_counter!(
                "streamwatch_records_processed_total",
                "Records that completed a full pipeline tick"
            )
            .expect("Failed to register records_processed_total"),

            malformed_fields: register_int_counter!(
                "streamwatch_malformed_fields_total",
                "Record fields dropped because they could not be parsed"
            )
            .expect("Failed to register malformed_fields_total"),

            tick_latency_seconds: register_histogram!(
                "streamwatch_tick_latency_seconds",
                "Time spent processing one record end to end",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            findings: register_int_counter_vec!(
                "streamwatch_findings_total",
                "Findings produced per detector",
                &["detector"]
            )
            .expect("Failed to register findings_total"),

            detector_failures: register_int_counter_vec!(
                "streamwatch_detector_failures_total",
                "Detector errors isolated during a tick",
                &["detector"]
            )
            .expect("Failed to register detector_failures_total"),

            alert_events: register_int_counter_vec!(
                "streamwatch_alert_events_total",
                "Alert events emitted downstream",
                &["event", "severity"]
            )
            .expect("Failed to register alert_events_total"),

            series_tracked: register_int_gauge!(
                "streamwatch_series_tracked",
                "Number of series with pipeline state"
            )
            .expect("Failed to register series_tracked"),

            active_alerts: register_int_gauge!(
                "streamwatch_active_alerts",
                "Alerts currently in the active state"
            )
            .expect("Failed to register active_alerts"),

            model_trainings: register_int_counter_vec!(
                "streamwatch_model_trainings_total",
                "Isolation forest training attempts",
                &["outcome"]
            )
            .expect("Failed to register model_trainings_total"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64) {
        let inner = self.inner();
        inner.records_processed.inc();
        inner.tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_malformed(&self, count: u64) {
        self.inner().malformed_fields.inc_by(count);
    }

    pub fn add_findings(&self, detector: &str, count: usize) {
        if count > 0 {
            self.inner()
                .findings
                .with_label_values(&[detector])
                .inc_by(count as u64);
        }
    }

    pub fn inc_detector_failure(&self, detector: &str) {
        self.inner()
            .detector_failures
            .with_label_values(&[detector])
            .inc();
    }

    pub fn inc_alert_event(&self, transition: AlertTransition, severity: Severity) {
        self.inner()
            .alert_events
            .with_label_values(&[transition.as_str(), severity.as_str()])
            .inc();
    }

    pub fn set_series_tracked(&self, count: usize) {
        self.inner().series_tracked.set(count as i64);
    }

    pub fn add_active_alerts(&self, delta: i64) {
        self.inner().active_alerts.add(delta);
    }

    pub fn inc_model_training(&self, outcome: &str) {
        self.inner()
            .model_trainings
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Structured logger for pipeline events
///
/// Every line carries an `event` name and the instance name so JSON logs can
/// be filtered without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_startup(&self, version: &str, source: &str) {
        info!(
            event = "pipeline_started",
            instance = %self.instance,
            version = %version,
            source = %source,
            "Detection pipeline started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "pipeline_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Detection pipeline shutting down"
        );
    }

    /// Log an emitted alert event; critical alerts log at warn
    pub fn log_alert(&self, event: &AlertEvent) {
        let alert = &event.alert;
        let raising = matches!(
            event.transition,
            AlertTransition::Raised | AlertTransition::Escalated | AlertTransition::Renotified
        );
        if alert.severity == Severity::Critical && raising {
            warn!(
                event = "alert",
                instance = %self.instance,
                transition = %event.transition,
                series = %alert.series_key,
                kind = %alert.kind,
                source = %alert.source_id,
                severity = %alert.severity,
                score = alert.score,
                occurrences = alert.occurrence_count,
                detail = %alert.detail,
                "Critical alert {}", event.transition
            );
        } else {
            info!(
                event = "alert",
                instance = %self.instance,
                transition = %event.transition,
                series = %alert.series_key,
                kind = %alert.kind,
                source = %alert.source_id,
                severity = %alert.severity,
                score = alert.score,
                occurrences = alert.occurrence_count,
                detail = %alert.detail,
                "Alert {}", event.transition
            );
        }
    }

    pub fn log_alerts_cleared(&self, severity: Option<Severity>, active: usize, history: usize) {
        info!(
            event = "alerts_cleared",
            instance = %self.instance,
            severity = severity.map(|s| s.as_str()).unwrap_or("all"),
            active = active,
            history = history,
            "Alerts cleared"
        );
    }

    pub fn log_detector_failure(&self, series: &str, detector: &str, reason: &str) {
        warn!(
            event = "detector_failure",
            instance = %self.instance,
            series = %series,
            detector = %detector,
            reason = %reason,
            "Detector failed, skipping it for this tick"
        );
    }

    pub fn log_malformed_field(&self, series: &str, field: &str, reason: &str) {
        debug!(
            event = "malformed_field",
            instance = %self.instance,
            series = %series,
            field = %field,
            reason = %reason,
            "Dropped malformed field"
        );
    }

    pub fn log_model_trained(&self, series: &str, version: u64, samples: usize, threshold: f64) {
        info!(
            event = "model_trained",
            instance = %self.instance,
            series = %series,
            version = version,
            samples = samples,
            threshold = threshold,
            "Isolation forest published"
        );
    }

    pub fn log_model_training_failed(&self, series: &str, reason: &str) {
        warn!(
            event = "model_training_failed",
            instance = %self.instance,
            series = %series,
            reason = %reason,
            "Isolation forest training failed, keeping previous model"
        );
    }
}
