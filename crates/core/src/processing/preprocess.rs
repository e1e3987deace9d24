//! Record cleaning
//!
//! Turns a loosely-typed [`RawRecord`] into an [`EventRecord`]. Unparseable
//! fields are dropped (absent, never zero) and reported back to the caller as
//! [`DetectError::MalformedRecord`] so they can be logged and counted. Numeric
//! fields are clipped and optionally EMA-smoothed; `status_code` is never
//! touched.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::{Bounds, ClipMode, PreprocessConfig};
use crate::error::DetectError;
use crate::feature::stats::RunningStats;
use crate::models::{EventRecord, ExtraValue, MetricField, RawRecord};

const TIMESTAMP_KEYS: &[&str] = &["timestamp"];
const SOURCE_KEYS: &[&str] = &["source_id", "source", "service"];
const STATUS_KEYS: &[&str] = &["status_code", "status"];
const RESPONSE_TIME_KEYS: &[&str] = &["response_time_ms", "response_time"];
const CPU_KEYS: &[&str] = &["cpu_pct", "cpu_usage"];
const MEM_KEYS: &[&str] = &["mem_pct", "memory_usage"];
const CLIENT_KEYS: &[&str] = &["client_addr", "ip", "remote_addr"];
const ENDPOINT_KEYS: &[&str] = &["endpoint", "path"];

/// Key used by stream sources to route a record to a series
pub const SERIES_KEY: &str = "series";

/// Epoch values above this are treated as milliseconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

fn field_keys(field: MetricField) -> &'static [&'static str] {
    match field {
        MetricField::ResponseTime => RESPONSE_TIME_KEYS,
        MetricField::Cpu => CPU_KEYS,
        MetricField::Memory => MEM_KEYS,
    }
}

fn is_known_key(key: &str) -> bool {
    key == SERIES_KEY
        || [
            TIMESTAMP_KEYS,
            SOURCE_KEYS,
            STATUS_KEYS,
            RESPONSE_TIME_KEYS,
            CPU_KEYS,
            MEM_KEYS,
            CLIENT_KEYS,
            ENDPOINT_KEYS,
        ]
        .iter()
        .any(|keys| keys.contains(&key))
}

/// Result of cleaning one raw record
#[derive(Debug, Clone)]
pub struct Cleaned {
    pub record: EventRecord,
    /// Fields that could not be parsed and were dropped
    pub issues: Vec<DetectError>,
}

#[derive(Debug, Clone, Default)]
struct FieldState {
    stats: RunningStats,
    ema: Option<f64>,
}

/// Per-series record cleaner
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
    fields: BTreeMap<MetricField, FieldState>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            fields: BTreeMap::new(),
        }
    }

    /// Parse, clip and smooth a raw record
    ///
    /// `default_source` fills a missing source id, `now` a missing timestamp.
    pub fn clean(&mut self, raw: &RawRecord, default_source: &str, now: DateTime<Utc>) -> Cleaned {
        let mut issues = Vec::new();

        let timestamp = match lookup(raw, TIMESTAMP_KEYS) {
            Some((key, value)) => parse_timestamp(value).unwrap_or_else(|reason| {
                issues.push(malformed(key, reason));
                now
            }),
            None => now,
        };

        let source_id = lookup_text(raw, SOURCE_KEYS, &mut issues)
            .unwrap_or_else(|| default_source.to_string());

        let mut record = EventRecord::new(source_id, timestamp);
        record.status_code = lookup(raw, STATUS_KEYS).and_then(|(key, value)| {
            parse_status(value)
                .map_err(|reason| issues.push(malformed(key, reason)))
                .ok()
                .flatten()
        });
        record.client_addr = lookup_text(raw, CLIENT_KEYS, &mut issues);
        record.endpoint = lookup_text(raw, ENDPOINT_KEYS, &mut issues);

        for field in MetricField::ALL {
            let value = lookup(raw, field_keys(field)).and_then(|(key, value)| {
                parse_number(value)
                    .map_err(|reason| issues.push(malformed(key, reason)))
                    .ok()
                    .flatten()
            });
            let adjusted = value.map(|v| self.adjust(field, v, &mut record.extra));
            *record.metric_mut(field) = adjusted;
        }

        for (key, value) in raw.iter().filter(|(k, _)| !is_known_key(k)) {
            match value {
                Value::Number(n) => {
                    if let Some(v) = n.as_f64() {
                        record.extra.insert(key.clone(), ExtraValue::Number(v));
                    }
                }
                Value::String(s) => {
                    record.extra.insert(key.clone(), ExtraValue::Text(s.clone()));
                }
                Value::Bool(b) => {
                    record.extra.insert(key.clone(), ExtraValue::Text(b.to_string()));
                }
                _ => {}
            }
        }

        Cleaned { record, issues }
    }

    /// Clip then smooth a single numeric value
    fn adjust(
        &mut self,
        field: MetricField,
        value: f64,
        extra: &mut BTreeMap<String, ExtraValue>,
    ) -> f64 {
        let bounds = self.bounds(field);
        let state = self.fields.entry(field).or_default();

        let clipped = match self.config.clip_mode {
            ClipMode::Off => value,
            ClipMode::Range => value.clamp(bounds.min, bounds.max),
            ClipMode::Sigma => {
                let std = state.stats.std_dev();
                if state.stats.count() >= self.config.clip_min_samples && std > f64::EPSILON {
                    let spread = self.config.clip_sigma * std;
                    let mean = state.stats.mean();
                    value.clamp(mean - spread, mean + spread)
                } else {
                    value
                }
            }
        };
        state.stats.push(clipped);

        let adjusted = if self.config.smoothing {
            let alpha = self.config.smoothing_alpha();
            let next = match state.ema {
                Some(prev) => alpha * clipped + (1.0 - alpha) * prev,
                None => clipped,
            };
            state.ema = Some(next);
            next
        } else {
            clipped
        };

        if adjusted != value {
            extra.insert(format!("{}_original", field), ExtraValue::Number(value));
        }
        adjusted
    }

    fn bounds(&self, field: MetricField) -> Bounds {
        match field {
            MetricField::ResponseTime => self.config.response_time_bounds,
            MetricField::Cpu => self.config.cpu_bounds,
            MetricField::Memory => self.config.mem_bounds,
        }
    }
}

fn malformed(field: &str, reason: impl Into<String>) -> DetectError {
    DetectError::MalformedRecord {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// First present, non-null value among the aliases
fn lookup<'a>(raw: &'a RawRecord, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter().find_map(|key| match raw.get(*key) {
        Some(Value::Null) | None => None,
        Some(value) => Some((*key, value)),
    })
}

fn lookup_text(
    raw: &RawRecord,
    keys: &[&'static str],
    issues: &mut Vec<DetectError>,
) -> Option<String> {
    let (key, value) = lookup(raw, keys)?;
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(_) => None,
        other => {
            issues.push(malformed(key, format!("expected text, got {}", kind_of(other))));
            None
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Numbers or numeric strings; empty strings count as absent
fn parse_number(value: &Value) -> Result<Option<f64>, String> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => return Err(format!("expected number, got {}", kind_of(other))),
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("not a finite number: {value}")),
    }
}

fn parse_status(value: &Value) -> Result<Option<u16>, String> {
    let Some(v) = parse_number(value)? else {
        return Ok(None);
    };
    if v.fract() != 0.0 || !(100.0..=599.0).contains(&v) {
        return Err(format!("not an HTTP status code: {v}"));
    }
    Ok(Some(v as u16))
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let v = n.as_f64().ok_or_else(|| "invalid epoch".to_string())?;
            epoch_to_datetime(v)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Ok(Utc.from_utc_datetime(&naive));
            }
            match s.parse::<f64>() {
                Ok(v) => epoch_to_datetime(v),
                Err(_) => Err(format!("unrecognised timestamp '{s}'")),
            }
        }
        other => Err(format!("expected timestamp, got {}", kind_of(other))),
    }
}

fn epoch_to_datetime(v: f64) -> Result<DateTime<Utc>, String> {
    if !v.is_finite() || v < 0.0 {
        return Err(format!("invalid epoch {v}"));
    }
    let millis = if v > EPOCH_MILLIS_THRESHOLD {
        v as i64
    } else {
        (v * 1000.0) as i64
    };
    DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("epoch out of range: {v}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn clean(pre: &mut Preprocessor, value: Value) -> Cleaned {
        pre.clean(&raw(value), "default", Utc::now())
    }

    #[test]
    fn test_aliases_resolved() {
        let mut pre = Preprocessor::new(PreprocessConfig::default());
        let cleaned = clean(
            &mut pre,
            json!({
                "timestamp": "2024-03-01T12:00:00Z",
                "service": "checkout",
                "status": 503,
                "response_time": "120.5",
                "cpu_usage": 55,
                "memory_usage": 61.5,
                "ip": "10.0.0.7",
                "path": "/pay",
                "region": "eu-west",
                "attempt": 2
            }),
        );
        let r = cleaned.record;
        assert!(cleaned.issues.is_empty());
        assert_eq!(r.source_id, "checkout");
        assert_eq!(r.status_code, Some(503));
        assert_eq!(r.response_time_ms, Some(120.5));
        assert_eq!(r.cpu_pct, Some(55.0));
        assert_eq!(r.mem_pct, Some(61.5));
        assert_eq!(r.client_addr.as_deref(), Some("10.0.0.7"));
        assert_eq!(r.endpoint.as_deref(), Some("/pay"));
        assert_eq!(
            r.extra.get("region"),
            Some(&ExtraValue::Text("eu-west".into()))
        );
        assert_eq!(r.extra.get("attempt"), Some(&ExtraValue::Number(2.0)));
        assert_eq!(r.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_malformed_fields_are_absent_not_zero() {
        let mut pre = Preprocessor::new(PreprocessConfig::default());
        let cleaned = clean(
            &mut pre,
            json!({"response_time_ms": "fast", "cpu_pct": [1, 2], "status_code": 42}),
        );
        assert_eq!(cleaned.record.response_time_ms, None);
        assert_eq!(cleaned.record.cpu_pct, None);
        assert_eq!(cleaned.record.status_code, None);
        assert_eq!(cleaned.record.source_id, "default");
        assert_eq!(cleaned.issues.len(), 3);
        assert!(cleaned
            .issues
            .iter()
            .all(|e| matches!(e, DetectError::MalformedRecord { .. })));
    }

    #[test]
    fn test_epoch_timestamps() {
        let mut pre = Preprocessor::new(PreprocessConfig::default());
        let secs = clean(&mut pre, json!({"timestamp": 1_700_000_000}));
        let millis = clean(&mut pre, json!({"timestamp": 1_700_000_000_000i64}));
        assert_eq!(secs.record.timestamp, millis.record.timestamp);
        assert_eq!(secs.record.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_range_clipping_keeps_original() {
        let mut pre = Preprocessor::new(PreprocessConfig::default());
        let cleaned = clean(&mut pre, json!({"cpu_pct": 140.0, "status_code": 200}));
        assert_eq!(cleaned.record.cpu_pct, Some(100.0));
        assert_eq!(
            cleaned.record.extra.get("cpu_pct_original"),
            Some(&ExtraValue::Number(140.0))
        );
        assert_eq!(cleaned.record.status_code, Some(200));
    }

    #[test]
    fn test_sigma_clipping_after_warmup() {
        let config = PreprocessConfig {
            clip_mode: ClipMode::Sigma,
            clip_sigma: 3.0,
            clip_min_samples: 10,
            ..PreprocessConfig::default()
        };
        let mut pre = Preprocessor::new(config);
        for i in 0..20 {
            clean(&mut pre, json!({"response_time_ms": 100.0 + (i % 5) as f64}));
        }
        let cleaned = clean(&mut pre, json!({"response_time_ms": 10_000.0}));
        let value = cleaned.record.response_time_ms.unwrap();
        assert!(value < 120.0, "expected clip, got {value}");
    }

    #[test]
    fn test_smoothing_never_touches_status() {
        let config = PreprocessConfig {
            smoothing: true,
            smoothing_span: 3,
            ..PreprocessConfig::default()
        };
        let mut pre = Preprocessor::new(config);
        clean(&mut pre, json!({"response_time_ms": 100.0, "status_code": 200}));
        let cleaned = clean(&mut pre, json!({"response_time_ms": 200.0, "status_code": 503}));
        // alpha = 0.5
        assert_eq!(cleaned.record.response_time_ms, Some(150.0));
        assert_eq!(cleaned.record.status_code, Some(503));
    }
}
