//! Change-point detection with two adjacent sliding windows
//!
//! Values flow into the "after" window; values leaving it move into the
//! "before" window. Once both are full the normalized mean difference is
//! tested, then the variance ratio. A variance rise only counts when both
//! halves of the after window carry it, so a level step passing through the
//! window is never mistaken for volatility. After a flagged change the
//! after-window becomes the new baseline so one shift fires once.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::config::ChangePointConfig;
use crate::error::{DetectError, Result};
use crate::feature::stats::{mean, std_dev};
use crate::models::{AnomalyKind, Finding, MetricField, Severity};

use super::{DetectionContext, Detector};

const NAME: &str = "changepoint";

/// Relative change at which a shift is reported as critical
const CRITICAL_RELATIVE_CHANGE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftKind {
    Level,
    Volatility,
}

/// A detected shift in level or spread
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangePoint {
    pub kind: ShiftKind,
    pub before_mean: f64,
    pub after_mean: f64,
    pub before_std: f64,
    pub after_std: f64,
    /// Level: |after - before| / pooled std. Volatility: after / before
    /// variance. Infinite when the baseline is flat.
    pub magnitude: f64,
    pub relative_change: f64,
}

impl ChangePoint {
    pub fn is_increase(&self) -> bool {
        match self.kind {
            ShiftKind::Level => self.after_mean > self.before_mean,
            ShiftKind::Volatility => self.after_std > self.before_std,
        }
    }
}

fn variance(values: &[f64]) -> f64 {
    std_dev(values).powi(2)
}

/// `num / den` with a flat denominator mapping to 0 or infinity
fn ratio(num: f64, den: f64) -> f64 {
    if den > f64::EPSILON {
        num / den
    } else if num > f64::EPSILON {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Sliding two-window mean and variance test over one value stream
#[derive(Debug, Clone)]
pub struct TwoWindowTest {
    before: VecDeque<f64>,
    after: VecDeque<f64>,
    window: usize,
    threshold: f64,
    min_change: f64,
    variance_ratio: f64,
}

impl TwoWindowTest {
    pub fn new(config: &ChangePointConfig) -> Self {
        Self {
            before: VecDeque::with_capacity(config.window),
            after: VecDeque::with_capacity(config.window),
            window: config.window,
            threshold: config.threshold,
            min_change: config.min_change,
            variance_ratio: config.variance_ratio,
        }
    }

    pub fn is_warm(&self) -> bool {
        self.before.len() == self.window && self.after.len() == self.window
    }

    /// Number of values held across both windows
    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    pub fn observe(&mut self, value: f64) -> Option<ChangePoint> {
        if !value.is_finite() {
            return None;
        }
        self.after.push_back(value);
        if self.after.len() > self.window {
            if let Some(moved) = self.after.pop_front() {
                self.before.push_back(moved);
            }
            if self.before.len() > self.window {
                self.before.pop_front();
            }
        }
        if !self.is_warm() {
            return None;
        }

        let before: Vec<f64> = self.before.iter().copied().collect();
        let after: Vec<f64> = self.after.iter().copied().collect();
        let cp = self
            .level_shift(&before, &after)
            .or_else(|| self.volatility_shift(&before, &after))?;
        self.before = std::mem::take(&mut self.after);
        Some(cp)
    }

    fn level_shift(&self, before: &[f64], after: &[f64]) -> Option<ChangePoint> {
        let before_mean = mean(before)?;
        let after_mean = mean(after)?;
        let diff = (after_mean - before_mean).abs();
        if diff <= f64::EPSILON {
            return None;
        }

        let before_std = std_dev(before);
        let after_std = std_dev(after);
        let pooled = ((before_std.powi(2) + after_std.powi(2)) / 2.0).sqrt();
        let magnitude = if pooled > f64::EPSILON {
            diff / pooled
        } else {
            f64::INFINITY
        };
        let relative_change = diff / before_mean.abs().max(f64::EPSILON);

        if magnitude < self.threshold || relative_change < self.min_change {
            return None;
        }
        Some(ChangePoint {
            kind: ShiftKind::Level,
            before_mean,
            after_mean,
            before_std,
            after_std,
            magnitude,
            relative_change,
        })
    }

    fn volatility_shift(&self, before: &[f64], after: &[f64]) -> Option<ChangePoint> {
        let baseline = variance(before);
        let (head, tail) = after.split_at(after.len() / 2);
        let sustained = ratio(variance(head), baseline).min(ratio(variance(tail), baseline));
        if sustained < self.variance_ratio {
            return None;
        }

        let before_std = std_dev(before);
        let after_std = std_dev(after);
        Some(ChangePoint {
            kind: ShiftKind::Volatility,
            before_mean: mean(before)?,
            after_mean: mean(after)?,
            before_std,
            after_std,
            magnitude: ratio(variance(after), baseline),
            relative_change: ratio(after_std - before_std, before_std),
        })
    }
}

/// Per-series change-point detector over every monitored field
pub struct ChangePointDetector {
    config: ChangePointConfig,
    tests: BTreeMap<MetricField, TwoWindowTest>,
}

impl ChangePointDetector {
    pub fn new(config: ChangePointConfig) -> Self {
        Self {
            config,
            tests: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, field: MetricField, value: f64) -> Option<ChangePoint> {
        let config = &self.config;
        self.tests
            .entry(field)
            .or_insert_with(|| TwoWindowTest::new(config))
            .observe(value)
    }
}

impl ChangePointDetector {
    fn finding(&self, ctx: &DetectionContext<'_>, field: MetricField, cp: &ChangePoint) -> Finding {
        let (severity, score, detail) = match cp.kind {
            ShiftKind::Level => (
                if cp.relative_change >= CRITICAL_RELATIVE_CHANGE {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                cp.magnitude / (2.0 * self.config.threshold),
                format!(
                    "{field} level {} from {:.2} to {:.2} ({:+.0}%)",
                    if cp.is_increase() { "rose" } else { "fell" },
                    cp.before_mean,
                    cp.after_mean,
                    (cp.after_mean - cp.before_mean) / cp.before_mean.abs().max(f64::EPSILON)
                        * 100.0
                ),
            ),
            ShiftKind::Volatility => (
                Severity::Warning,
                cp.magnitude / (2.0 * self.config.variance_ratio),
                format!(
                    "{field} variance rose {:.1}x (std {:.2} to {:.2}) around {:.2}",
                    cp.magnitude, cp.before_std, cp.after_std, cp.after_mean
                ),
            ),
        };
        Finding::for_record(
            NAME,
            ctx.series_key,
            ctx.record,
            AnomalyKind::ChangePoint,
            severity,
            score,
        )
        .with_detail(detail)
    }
}

impl Detector for ChangePointDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        let mut warm = false;

        for field in MetricField::ALL {
            let Some(value) = ctx.record.metric(field) else {
                continue;
            };
            if let Some(cp) = self.observe(field, value) {
                findings.push(self.finding(ctx, field, &cp));
            }
            warm |= self.tests.get(&field).map(|t| t.is_warm()).unwrap_or(false);
        }

        if !warm && findings.is_empty() {
            let have = self.tests.values().map(|t| t.len()).max().unwrap_or(0);
            return Err(DetectError::insufficient(have, 2 * self.config.window));
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize) -> ChangePointConfig {
        ChangePointConfig {
            window,
            ..ChangePointConfig::default()
        }
    }

    fn noisy(level: f64, i: usize) -> f64 {
        level + if i % 2 == 0 { 1.0 } else { -1.0 }
    }

    #[test]
    fn test_no_change_on_stable_series() {
        let mut test = TwoWindowTest::new(&config(10));
        for i in 0..100 {
            assert!(test.observe(noisy(50.0, i)).is_none());
        }
        assert!(test.is_warm());
    }

    #[test]
    fn test_level_shift_fires_once() {
        let mut test = TwoWindowTest::new(&config(10));
        for i in 0..20 {
            test.observe(noisy(50.0, i));
        }
        let mut fired = Vec::new();
        for i in 0..40 {
            if let Some(cp) = test.observe(noisy(100.0, i)) {
                fired.push(cp);
            }
        }
        assert_eq!(fired.len(), 1);
        let cp = &fired[0];
        assert_eq!(cp.kind, ShiftKind::Level);
        assert!(cp.is_increase());
        assert!(cp.magnitude >= 3.0);
        assert!(cp.relative_change >= 0.2);
    }

    #[test]
    fn test_variance_rise_at_same_mean_fires_once() {
        let mut test = TwoWindowTest::new(&config(10));
        for i in 0..20 {
            test.observe(noisy(100.0, i));
        }
        // Same level, ten times the variance
        let wide = 10f64.sqrt();
        let mut fired = Vec::new();
        for i in 0..40 {
            let value = 100.0 + if i % 2 == 0 { wide } else { -wide };
            if let Some(cp) = test.observe(value) {
                fired.push(cp);
            }
        }
        assert_eq!(fired.len(), 1);
        let cp = &fired[0];
        assert_eq!(cp.kind, ShiftKind::Volatility);
        assert!(cp.is_increase());
        assert!(cp.magnitude >= 4.0);
        assert!((cp.after_mean - cp.before_mean).abs() < 1.0);
    }

    #[test]
    fn test_variance_ratio_is_configurable() {
        let strict = ChangePointConfig {
            window: 10,
            variance_ratio: 50.0,
            ..ChangePointConfig::default()
        };
        let mut test = TwoWindowTest::new(&strict);
        for i in 0..20 {
            test.observe(noisy(100.0, i));
        }
        let wide = 10f64.sqrt();
        for i in 0..40 {
            let value = 100.0 + if i % 2 == 0 { wide } else { -wide };
            assert!(test.observe(value).is_none());
        }
    }

    #[test]
    fn test_small_relative_change_ignored() {
        // Large in sigma units but only a 10% move
        let mut test = TwoWindowTest::new(&config(10));
        for _ in 0..20 {
            test.observe(100.0);
        }
        for _ in 0..20 {
            assert!(test.observe(110.0).is_none());
        }
    }

    #[test]
    fn test_flat_step_fires() {
        let mut test = TwoWindowTest::new(&config(5));
        for _ in 0..10 {
            test.observe(10.0);
        }
        let mut fired = 0;
        for _ in 0..10 {
            if test.observe(30.0).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_warmup_needs_both_windows() {
        let mut test = TwoWindowTest::new(&config(20));
        for i in 0..39 {
            assert!(test.observe(i as f64 * 100.0).is_none());
        }
        assert!(!test.is_warm());
        assert_eq!(test.len(), 39);
    }
}
