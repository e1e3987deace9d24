//! Z-score outlier detection
//!
//! Keeps Welford running statistics per monitored field. Each incoming value
//! is scored against the history accumulated so far and only then folded in.

use std::collections::BTreeMap;

use crate::config::ZScoreConfig;
use crate::error::{DetectError, Result};
use crate::feature::RunningStats;
use crate::models::{AnomalyKind, Finding, MetricField, Severity};

use super::{DetectionContext, Detector};

const NAME: &str = "zscore";

/// Per-series Z-score detector
pub struct ZScoreDetector {
    config: ZScoreConfig,
    stats: BTreeMap<MetricField, RunningStats>,
}

impl ZScoreDetector {
    pub fn new(config: ZScoreConfig) -> Self {
        Self {
            config,
            stats: BTreeMap::new(),
        }
    }

    /// Standard score of `value` against the history of `field`
    ///
    /// Fails with `InsufficientData` until `min_samples` values were seen or
    /// while the history has no spread.
    pub fn score(&self, value: f64, field: MetricField) -> Result<f64> {
        let stats = self.stats.get(&field).copied().unwrap_or_default();
        let need = self.config.min_samples as usize;
        if stats.count() < self.config.min_samples {
            return Err(DetectError::insufficient(stats.count() as usize, need));
        }
        stats
            .z_score(value)
            .ok_or_else(|| DetectError::insufficient(stats.count() as usize, need))
    }

    pub fn observe(&mut self, value: f64, field: MetricField) {
        self.stats.entry(field).or_default().push(value);
    }

    pub fn samples(&self, field: MetricField) -> u64 {
        self.stats.get(&field).map(|s| s.count()).unwrap_or(0)
    }
}

impl Detector for ZScoreDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        let mut skipped = None;
        let mut evaluated = false;

        for field in MetricField::ALL {
            let Some(value) = ctx.record.metric(field) else {
                continue;
            };

            match self.score(value, field) {
                Ok(z) => {
                    evaluated = true;
                    if z.abs() >= self.config.threshold {
                        let severity = if z.abs() >= self.config.critical_threshold {
                            Severity::Critical
                        } else {
                            Severity::Warning
                        };
                        let stats = self.stats.get(&field).copied().unwrap_or_default();
                        findings.push(
                            Finding::for_record(
                                NAME,
                                ctx.series_key,
                                ctx.record,
                                AnomalyKind::ZScoreOutlier,
                                severity,
                                z.abs() / (2.0 * self.config.threshold),
                            )
                            .with_detail(format!(
                                "{field}={value:.2} z={z:.2} (mean {:.2}, std {:.2})",
                                stats.mean(),
                                stats.std_dev()
                            )),
                        );
                    }
                }
                Err(e) if e.is_insufficient() => skipped = Some(e),
                Err(e) => return Err(e),
            }

            self.observe(value, field);
        }

        match skipped {
            Some(e) if !evaluated => Err(e),
            _ => Ok(findings),
        }
    }
}
