//! Core data models for the detection pipeline

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record as delivered by an ingestion source, before cleaning
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Extra field carried through the pipeline untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Number(f64),
    Text(String),
}

/// One cleaned observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic per-series ingest counter
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<f64>,
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    /// Requesting client (IP or remote address), used by the security rules
    pub client_addr: Option<String>,
    /// Requested endpoint, used by the concentration rule
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, ExtraValue>,
}

impl EventRecord {
    /// Minimal record for a source at a point in time
    pub fn new(source_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            timestamp,
            source_id: source_id.into(),
            status_code: None,
            response_time_ms: None,
            cpu_pct: None,
            mem_pct: None,
            client_addr: None,
            endpoint: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status_code.map(|c| c >= 400).unwrap_or(false)
    }

    pub fn metric(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::ResponseTime => self.response_time_ms,
            MetricField::Cpu => self.cpu_pct,
            MetricField::Memory => self.mem_pct,
        }
    }

    pub(crate) fn metric_mut(&mut self, field: MetricField) -> &mut Option<f64> {
        match field {
            MetricField::ResponseTime => &mut self.response_time_ms,
            MetricField::Cpu => &mut self.cpu_pct,
            MetricField::Memory => &mut self.mem_pct,
        }
    }
}

/// Numeric fields the pipeline cleans, aggregates and monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricField {
    #[serde(rename = "response_time_ms")]
    ResponseTime,
    #[serde(rename = "cpu_pct")]
    Cpu,
    #[serde(rename = "mem_pct")]
    Memory,
}

impl MetricField {
    pub const ALL: [MetricField; 3] = [
        MetricField::ResponseTime,
        MetricField::Cpu,
        MetricField::Memory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::ResponseTime => "response_time_ms",
            MetricField::Cpu => "cpu_pct",
            MetricField::Memory => "mem_pct",
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature value that may not have enough samples behind it yet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampled<T> {
    Ready(T),
    Insufficient { have: usize, need: usize },
}

impl<T: Copy> Sampled<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Sampled::Ready(v) => Some(*v),
            Sampled::Insufficient { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Sampled::Ready(_))
    }
}

/// Aggregates for one numeric field over the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    /// Number of records in the full window carrying this field
    pub samples: usize,
    pub baseline_mean: Option<f64>,
    pub recent_mean: Option<f64>,
    pub ema: f64,
    /// recent_mean / baseline_mean, with the baseline floored
    pub spike_score: Option<f64>,
}

/// Per-tick features derived from a series window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub series_key: String,
    pub timestamp: DateTime<Utc>,
    pub sample_count: usize,
    pub baseline_count: usize,
    pub recent_count: usize,
    pub rps_recent: Sampled<f64>,
    pub rps_baseline: Sampled<f64>,
    pub error_rate_recent: Sampled<f64>,
    pub error_rate_baseline: Sampled<f64>,
    pub response_time: Option<FieldStats>,
    pub cpu: Option<FieldStats>,
    pub mem: Option<FieldStats>,
}

impl FeatureVector {
    /// Number of dimensions produced by [`FeatureVector::ml_vector`]
    pub const ML_DIMENSIONS: usize = 8;

    pub fn field(&self, field: MetricField) -> Option<&FieldStats> {
        match field {
            MetricField::ResponseTime => self.response_time.as_ref(),
            MetricField::Cpu => self.cpu.as_ref(),
            MetricField::Memory => self.mem.as_ref(),
        }
    }

    /// Fixed-order numeric view used by the isolation forest
    ///
    /// Absent or insufficient features map to 0.0 so every vector has the
    /// same dimensionality.
    pub fn ml_vector(&self) -> Vec<f64> {
        let recent = |s: Option<&FieldStats>| s.and_then(|s| s.recent_mean.or(Some(s.mean)));
        vec![
            self.rps_recent.value().unwrap_or(0.0),
            self.error_rate_recent.value().unwrap_or(0.0),
            recent(self.response_time.as_ref()).unwrap_or(0.0),
            self.response_time.as_ref().map(|s| s.p95).unwrap_or(0.0),
            self.response_time.as_ref().map(|s| s.p99).unwrap_or(0.0),
            self.response_time
                .as_ref()
                .and_then(|s| s.spike_score)
                .unwrap_or(0.0),
            recent(self.cpu.as_ref()).unwrap_or(0.0),
            recent(self.mem.as_ref()).unwrap_or(0.0),
        ]
    }
}

/// Severity levels, ordered info < warning < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnomalyKind {
    #[serde(rename = "http_5xx")]
    Http5xx,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "latency_spike")]
    LatencySpike,
    #[serde(rename = "rps_spike")]
    RpsSpike,
    #[serde(rename = "rps_drop")]
    RpsDrop,
    #[serde(rename = "error_rate_spike")]
    ErrorRateSpike,
    #[serde(rename = "cpu_spike")]
    CpuSpike,
    #[serde(rename = "cpu_saturation")]
    CpuSaturation,
    #[serde(rename = "mem_leak")]
    MemLeak,
    #[serde(rename = "mem_oom_risk")]
    MemOomRisk,
    #[serde(rename = "ip_repeat_abuse")]
    IpRepeatAbuse,
    #[serde(rename = "burst_abuse")]
    BurstAbuse,
    #[serde(rename = "endpoint_concentration")]
    EndpointConcentration,
    #[serde(rename = "zscore_outlier")]
    ZScoreOutlier,
    #[serde(rename = "ml_outlier")]
    MlOutlier,
    #[serde(rename = "change_point")]
    ChangePoint,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Http5xx => "http_5xx",
            AnomalyKind::Http4xx => "http_4xx",
            AnomalyKind::LatencySpike => "latency_spike",
            AnomalyKind::RpsSpike => "rps_spike",
            AnomalyKind::RpsDrop => "rps_drop",
            AnomalyKind::ErrorRateSpike => "error_rate_spike",
            AnomalyKind::CpuSpike => "cpu_spike",
            AnomalyKind::CpuSaturation => "cpu_saturation",
            AnomalyKind::MemLeak => "mem_leak",
            AnomalyKind::MemOomRisk => "mem_oom_risk",
            AnomalyKind::IpRepeatAbuse => "ip_repeat_abuse",
            AnomalyKind::BurstAbuse => "burst_abuse",
            AnomalyKind::EndpointConcentration => "endpoint_concentration",
            AnomalyKind::ZScoreOutlier => "zscore_outlier",
            AnomalyKind::MlOutlier => "ml_outlier",
            AnomalyKind::ChangePoint => "change_point",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detector's anomaly signal for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Detector-defined score in [0, 1]
    pub score: f64,
    pub source_id: String,
    pub series_key: String,
    pub timestamp: DateTime<Utc>,
    pub detector_name: String,
    pub detail: String,
}

impl Finding {
    /// Finding attributed to the record's source
    pub fn for_record(
        detector_name: &str,
        series_key: &str,
        record: &EventRecord,
        kind: AnomalyKind,
        severity: Severity,
        score: f64,
    ) -> Self {
        Self {
            kind,
            severity,
            score: clamp_unit(score),
            source_id: record.source_id.clone(),
            series_key: series_key.to_string(),
            timestamp: record.timestamp,
            detector_name: detector_name.to_string(),
            detail: String::new(),
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            kind: self.kind,
            source_id: self.source_id.clone(),
        }
    }
}

/// Clamp a score into [0, 1], mapping NaN to 0
pub fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Deduplication key for alerts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertKey {
    pub kind: AnomalyKind,
    pub source_id: String,
}

/// Lifecycle state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Active,
    Resolved,
}

/// A deduplicated, stateful anomaly record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub series_key: String,
    pub kind: AnomalyKind,
    pub source_id: String,
    pub severity: Severity,
    /// Highest score observed across merged findings
    pub score: f64,
    pub detector_name: String,
    pub detail: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u32,
    pub state: AlertState,
    /// Set by an operator; cleared again when the alert escalates
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_finding(finding: &Finding) -> Self {
        Self {
            id: Uuid::new_v4(),
            series_key: finding.series_key.clone(),
            kind: finding.kind,
            source_id: finding.source_id.clone(),
            severity: finding.severity,
            score: finding.score,
            detector_name: finding.detector_name.clone(),
            detail: finding.detail.clone(),
            first_seen: finding.timestamp,
            last_seen: finding.timestamp,
            occurrence_count: 1,
            state: AlertState::Active,
            acknowledged: false,
            resolved_at: None,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            kind: self.kind,
            source_id: self.source_id.clone(),
        }
    }
}

/// What happened to an alert when it was emitted downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertTransition {
    Raised,
    Escalated,
    Renotified,
    Acknowledged,
    Resolved,
}

impl AlertTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertTransition::Raised => "raised",
            AlertTransition::Escalated => "escalated",
            AlertTransition::Renotified => "renotified",
            AlertTransition::Acknowledged => "acknowledged",
            AlertTransition::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert snapshot emitted to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub transition: AlertTransition,
    pub emitted_at: DateTime<Utc>,
    pub alert: Alert,
}
