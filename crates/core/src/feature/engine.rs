//! Feature derivation from a window snapshot
//!
//! [`FeatureEngine::compute`] is a pure function of the snapshot apart from the
//! per-field EMA accumulators, which persist across ticks for one series.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::FeatureConfig;
use crate::feature::stats::{mean, percentile, sort_floats, std_dev};
use crate::models::{EventRecord, FeatureVector, FieldStats, MetricField, Sampled};
use crate::processing::WindowSnapshot;

const MIN_SPAN_SECS: f64 = 0.001;

/// Per-series feature engine
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    config: FeatureConfig,
    ema: BTreeMap<MetricField, f64>,
}

impl FeatureEngine {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            ema: BTreeMap::new(),
        }
    }

    pub fn compute(&mut self, series_key: &str, snapshot: &WindowSnapshot<'_>) -> FeatureVector {
        let baseline: Vec<&EventRecord> = snapshot.baseline().collect();
        let recent: Vec<&EventRecord> = snapshot.recent().collect();
        let timestamp = snapshot
            .latest()
            .map(|r| r.timestamp)
            .unwrap_or_else(Utc::now);

        let response_time = self.field_stats(MetricField::ResponseTime, snapshot, &baseline, &recent);
        let cpu = self.field_stats(MetricField::Cpu, snapshot, &baseline, &recent);
        let mem = self.field_stats(MetricField::Memory, snapshot, &baseline, &recent);

        FeatureVector {
            series_key: series_key.to_string(),
            timestamp,
            sample_count: snapshot.len(),
            baseline_count: baseline.len(),
            recent_count: recent.len(),
            rps_recent: self.rate(&recent),
            rps_baseline: self.rate(&baseline),
            error_rate_recent: self.error_rate(&recent),
            error_rate_baseline: self.error_rate(&baseline),
            response_time,
            cpu,
            mem,
        }
    }

    /// Inter-arrival rate in records per second
    fn rate(&self, records: &[&EventRecord]) -> Sampled<f64> {
        let need = self.config.min_recent_samples.max(2);
        if records.len() < need {
            return Sampled::Insufficient {
                have: records.len(),
                need,
            };
        }
        let (first, last) = match (records.first(), records.last()) {
            (Some(f), Some(l)) => (f.timestamp, l.timestamp),
            _ => return Sampled::Insufficient { have: 0, need },
        };
        let span = span_secs(first, last).max(MIN_SPAN_SECS);
        Sampled::Ready((records.len() - 1) as f64 / span)
    }

    /// Fraction of status-bearing records with status >= 400
    fn error_rate(&self, records: &[&EventRecord]) -> Sampled<f64> {
        let need = self.config.min_recent_samples;
        let (total, errors) = records
            .iter()
            .filter(|r| r.status_code.is_some())
            .fold((0usize, 0usize), |(t, e), r| (t + 1, e + r.is_error() as usize));
        if total < need {
            Sampled::Insufficient { have: total, need }
        } else {
            Sampled::Ready(errors as f64 / total as f64)
        }
    }

    fn field_stats(
        &mut self,
        field: MetricField,
        snapshot: &WindowSnapshot<'_>,
        baseline: &[&EventRecord],
        recent: &[&EventRecord],
    ) -> Option<FieldStats> {
        let mut values: Vec<f64> = snapshot.full().filter_map(|r| r.metric(field)).collect();
        if values.is_empty() {
            return None;
        }

        let ema = self.update_ema(field, snapshot.latest().and_then(|r| r.metric(field)));

        let mean_full = mean(&values).unwrap_or(0.0);
        let std = std_dev(&values);
        sort_floats(&mut values);
        let samples = values.len();
        let min = values[0];
        let max = values[samples - 1];
        let p95 = percentile(&values, 95.0).unwrap_or(max);
        let p99 = percentile(&values, 99.0).unwrap_or(max);

        let baseline_mean = self.sub_mean(field, baseline);
        let recent_mean = self.sub_mean(field, recent);
        let spike_score = match (recent_mean, baseline_mean) {
            (Some(r), Some(b)) => Some(r / b.max(self.config.baseline_floor)),
            _ => None,
        };

        Some(FieldStats {
            mean: mean_full,
            std,
            min,
            max,
            p95,
            p99,
            samples,
            baseline_mean,
            recent_mean,
            ema: ema.unwrap_or(mean_full),
            spike_score,
        })
    }

    /// Mean over a sub-window, only when it has enough samples
    fn sub_mean(&self, field: MetricField, records: &[&EventRecord]) -> Option<f64> {
        let values: Vec<f64> = records.iter().filter_map(|r| r.metric(field)).collect();
        if values.len() < self.config.min_recent_samples {
            None
        } else {
            mean(&values)
        }
    }

    fn update_ema(&mut self, field: MetricField, latest: Option<f64>) -> Option<f64> {
        let alpha = self.config.ema_alpha;
        match (latest, self.ema.get(&field).copied()) {
            (Some(v), Some(prev)) => {
                let next = alpha * v + (1.0 - alpha) * prev;
                self.ema.insert(field, next);
                Some(next)
            }
            (Some(v), None) => {
                self.ema.insert(field, v);
                Some(v)
            }
            (None, prev) => prev,
        }
    }
}

fn span_secs(first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    (last - first).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::processing::Window;
    use chrono::{Duration, TimeZone};

    fn record(i: i64, millis_apart: i64) -> EventRecord {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut r = EventRecord::new("api", base + Duration::milliseconds(i * millis_apart));
        r.status_code = Some(200);
        r
    }

    fn window_of(records: Vec<EventRecord>) -> Window {
        let mut window = Window::new(&WindowConfig::default());
        for r in records {
            window.append(r);
        }
        window
    }

    #[test]
    fn test_steady_rate() {
        let window = window_of((0..100).map(|i| record(i, 100)).collect());
        let mut engine = FeatureEngine::new(FeatureConfig::default());
        let fv = engine.compute("api", &window.snapshot());

        let recent = fv.rps_recent.value().unwrap();
        let baseline = fv.rps_baseline.value().unwrap();
        assert!((recent - 10.0).abs() < 0.01, "recent rps {recent}");
        assert!((baseline - 10.0).abs() < 0.01, "baseline rps {baseline}");
        assert_eq!(fv.error_rate_recent.value(), Some(0.0));
    }

    #[test]
    fn test_insufficient_recent_samples() {
        let window = window_of((0..5).map(|i| record(i, 100)).collect());
        let mut engine = FeatureEngine::new(FeatureConfig::default());
        let fv = engine.compute("api", &window.snapshot());
        // 5 records -> 1 recent
        assert_eq!(fv.recent_count, 1);
        assert!(matches!(
            fv.rps_recent,
            Sampled::Insufficient { have: 1, need: 3 }
        ));
        assert!(!fv.error_rate_recent.is_ready());
    }

    #[test]
    fn test_response_time_stats_and_spike_score() {
        let records = (0..20)
            .map(|i| {
                let mut r = record(i, 100);
                r.response_time_ms = Some(if i < 16 { 100.0 } else { 300.0 });
                r
            })
            .collect();
        let window = window_of(records);
        let mut engine = FeatureEngine::new(FeatureConfig::default());
        let fv = engine.compute("api", &window.snapshot());
        let rt = fv.response_time.unwrap();
        assert_eq!(rt.baseline_mean, Some(100.0));
        assert_eq!(rt.recent_mean, Some(300.0));
        assert!((rt.spike_score.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(rt.max, 300.0);
        assert_eq!(rt.samples, 20);
        assert!(fv.cpu.is_none());
    }

    #[test]
    fn test_ema_persists_across_calls() {
        let mut engine = FeatureEngine::new(FeatureConfig::default());
        let mut window = Window::new(&WindowConfig::default());

        let mut first = record(0, 100);
        first.cpu_pct = Some(10.0);
        window.append(first);
        let fv = engine.compute("api", &window.snapshot());
        assert_eq!(fv.cpu.unwrap().ema, 10.0);

        let mut second = record(1, 100);
        second.cpu_pct = Some(20.0);
        window.append(second);
        let fv = engine.compute("api", &window.snapshot());
        // 0.3 * 20 + 0.7 * 10
        assert!((fv.cpu.unwrap().ema - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_spike_score_floor_guards_zero_baseline() {
        let records = (0..20)
            .map(|i| {
                let mut r = record(i, 100);
                r.cpu_pct = Some(if i < 16 { 0.0 } else { 50.0 });
                r
            })
            .collect();
        let window = window_of(records);
        let mut engine = FeatureEngine::new(FeatureConfig::default());
        let fv = engine.compute("api", &window.snapshot());
        let score = fv.cpu.unwrap().spike_score.unwrap();
        assert!(score.is_finite());
        assert!(score > 1.0);
    }
}
