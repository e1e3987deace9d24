//! Isolation forest detector
//!
//! A forest is built once from a batch of feature vectors and never mutated
//! afterwards. Retraining builds a fresh forest and publishes it through
//! [`ModelSlot`], an `ArcSwapOption`, so scoring always sees either the old or
//! the new model in full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use crate::config::IsolationForestConfig;
use crate::error::{DetectError, Result};
use crate::feature::stats::{percentile, sort_floats};
use crate::models::{AnomalyKind, Finding, Severity};

use super::{DetectionContext, Detector};

const NAME: &str = "isolation_forest";

const EULER_GAMMA: f64 = 0.5772156649;

/// Expected path length of an unsuccessful BST search over `n` points
fn c(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[derive(Debug, Clone)]
enum IsolationNode {
    Internal {
        split_feature: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    fn build(data: &[&[f64]], height_limit: usize, rng: &mut StdRng) -> Self {
        Self {
            root: Self::grow(data, 0, height_limit, rng),
        }
    }

    fn grow(data: &[&[f64]], depth: usize, height_limit: usize, rng: &mut StdRng) -> IsolationNode {
        if depth >= height_limit || data.len() <= 1 {
            return IsolationNode::Leaf { size: data.len() };
        }

        let dims = data[0].len();
        // Only dimensions with a finite, non-zero spread can split
        let candidates: Vec<(usize, f64, f64)> = (0..dims)
            .filter_map(|d| {
                let (lo, hi) = data.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v[d]), hi.max(v[d]))
                });
                let spread = hi - lo;
                (spread.is_finite() && spread > f64::EPSILON).then_some((d, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return IsolationNode::Leaf { size: data.len() };
        }

        let (split_feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let split_value = rng.gen_range(lo..hi);

        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
            data.iter().partition(|v| v[split_feature] < split_value);

        IsolationNode::Internal {
            split_feature,
            split_value,
            left: Box::new(Self::grow(&left, depth + 1, height_limit, rng)),
            right: Box::new(Self::grow(&right, depth + 1, height_limit, rng)),
        }
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsolationNode::Leaf { size } => return depth as f64 + c(*size),
                IsolationNode::Internal {
                    split_feature,
                    split_value,
                    left,
                    right,
                } => {
                    let v = point.get(*split_feature).copied().unwrap_or(0.0);
                    node = if v < *split_value { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

/// A trained, immutable isolation forest
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    dimensions: usize,
    threshold: f64,
    trained_on: usize,
    trained_at: DateTime<Utc>,
}

impl IsolationForest {
    /// Build a forest from a feature history
    ///
    /// Fails with `InsufficientData` below `min_training_samples`. The same
    /// history and seed always produce the same forest.
    pub fn fit(history: &[Vec<f64>], config: &IsolationForestConfig) -> Result<Self> {
        if history.len() < config.min_training_samples {
            return Err(DetectError::insufficient(
                history.len(),
                config.min_training_samples,
            ));
        }
        let dimensions = history[0].len();
        if dimensions == 0 || history.iter().any(|v| v.len() != dimensions) {
            return Err(DetectError::failure(
                NAME,
                "feature history has inconsistent dimensions",
            ));
        }
        if history.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DetectError::failure(NAME, "feature history contains non-finite values"));
        }

        let sample_size = config.max_samples.min(history.len());
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let trees = (0..config.n_trees)
            .map(|_| {
                let subsample: Vec<&[f64]> = sample(&mut rng, history.len(), sample_size)
                    .into_iter()
                    .map(|i| history[i].as_slice())
                    .collect();
                IsolationTree::build(&subsample, height_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            dimensions,
            threshold: config.score_floor,
            trained_on: history.len(),
            trained_at: Utc::now(),
        };

        let mut training_scores: Vec<f64> = history.iter().map(|v| forest.score_point(v)).collect();
        sort_floats(&mut training_scores);
        let quantile = percentile(&training_scores, (1.0 - config.contamination) * 100.0)
            .unwrap_or(config.score_floor);
        forest.threshold = quantile.max(config.score_floor);

        Ok(forest)
    }

    /// Anomaly score in [0, 1]; higher is more anomalous
    pub fn score(&self, point: &[f64]) -> Result<f64> {
        if point.len() != self.dimensions {
            return Err(DetectError::failure(
                NAME,
                format!(
                    "expected {} dimensions, got {}",
                    self.dimensions,
                    point.len()
                ),
            ));
        }
        Ok(self.score_point(point))
    }

    fn score_point(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let avg = self.trees.iter().map(|t| t.path_length(point)).sum::<f64>()
            / self.trees.len() as f64;
        let norm = c(self.sample_size);
        if norm <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg / norm)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

/// Shared model handle and feature history for one series
///
/// The tick path appends to the history and loads the current model; the
/// retrainer snapshots the history and publishes replacement models.
#[derive(Debug)]
pub struct ModelSlot {
    model: ArcSwapOption<IsolationForest>,
    history: Mutex<VecDeque<Vec<f64>>>,
    history_size: usize,
    version: AtomicU64,
}

impl ModelSlot {
    pub fn new(history_size: usize) -> Self {
        Self {
            model: ArcSwapOption::empty(),
            history: Mutex::new(VecDeque::with_capacity(history_size.min(4096))),
            history_size,
            version: AtomicU64::new(0),
        }
    }

    pub fn record(&self, features: Vec<f64>) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(features);
        while history.len() > self.history_size {
            history.pop_front();
        }
    }

    /// Consistent copy of the feature history
    pub fn history_snapshot(&self) -> Vec<Vec<f64>> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Atomically replace the current model
    pub fn publish(&self, model: IsolationForest) -> u64 {
        self.model.store(Some(Arc::new(model)));
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Option<Arc<IsolationForest>> {
        self.model.load_full()
    }

    /// Number of models published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Scores each tick's feature vector against the published forest
pub struct IsolationForestDetector {
    config: IsolationForestConfig,
    slot: Arc<ModelSlot>,
}

impl IsolationForestDetector {
    pub fn new(config: IsolationForestConfig, slot: Arc<ModelSlot>) -> Self {
        Self { config, slot }
    }

    /// Train on `history` and publish the result
    pub fn fit(&self, history: &[Vec<f64>]) -> Result<u64> {
        let forest = IsolationForest::fit(history, &self.config)?;
        Ok(self.slot.publish(forest))
    }

    pub fn score(&self, features: &[f64]) -> Result<f64> {
        let model = self.slot.current().ok_or(DetectError::ModelUnavailable)?;
        model.score(features)
    }
}

impl Detector for IsolationForestDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>) -> Result<Vec<Finding>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let vector = ctx.features.ml_vector();
        if ctx.features.rps_recent.is_ready() {
            self.slot.record(vector.clone());
        }

        let model = self.slot.current().ok_or(DetectError::ModelUnavailable)?;
        let score = model.score(&vector)?;
        if score < model.threshold() {
            return Ok(Vec::new());
        }

        let severity = if score >= self.config.critical_score {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Ok(vec![Finding::for_record(
            NAME,
            ctx.series_key,
            ctx.record,
            AnomalyKind::MlOutlier,
            severity,
            score,
        )
        .with_detail(format!(
            "isolation score {score:.3} >= threshold {:.3}",
            model.threshold()
        ))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn config() -> IsolationForestConfig {
        IsolationForestConfig {
            min_training_samples: 20,
            ..IsolationForestConfig::default()
        }
    }

    fn normal_history(n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                vec![
                    10.0 + rng.gen_range(-1.0..1.0),
                    100.0 + rng.gen_range(-5.0..5.0),
                    40.0 + rng.gen_range(-3.0..3.0),
                ]
            })
            .collect()
    }

    #[test]
    fn test_c_factor() {
        assert_eq!(c(1), 0.0);
        assert!((c(2) - (2.0 * EULER_GAMMA - 1.0)).abs() < 1e-9);
        assert!(c(256) > c(16));
    }

    #[test]
    fn test_fit_requires_min_samples() {
        let err = IsolationForest::fit(&normal_history(5), &config()).unwrap_err();
        assert_eq!(err, DetectError::insufficient(5, 20));
    }

    #[test]
    fn test_outlier_scores_higher_than_inlier() {
        let forest = IsolationForest::fit(&normal_history(300), &config()).unwrap();
        let inlier = forest.score(&[10.0, 100.0, 40.0]).unwrap();
        let outlier = forest.score(&[60.0, 900.0, 99.0]).unwrap();
        assert!(outlier > inlier, "outlier {outlier} <= inlier {inlier}");
        assert!(outlier >= forest.threshold());
        assert!(inlier < forest.threshold());
        assert!((0.0..=1.0).contains(&outlier));
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let forest = IsolationForest::fit(&normal_history(100), &config()).unwrap();
        let point = [12.0, 110.0, 45.0];
        let a = forest.score(&point).unwrap();
        let b = forest.score(&point).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_same_seed_same_forest() {
        let history = normal_history(100);
        let a = IsolationForest::fit(&history, &config()).unwrap();
        let b = IsolationForest::fit(&history, &config()).unwrap();
        let point = [11.0, 95.0, 41.0];
        assert_eq!(a.score(&point).unwrap(), b.score(&point).unwrap());
        assert_eq!(a.threshold(), b.threshold());
    }

    #[test]
    fn test_threshold_respects_floor() {
        let forest = IsolationForest::fit(&normal_history(100), &config()).unwrap();
        assert!(forest.threshold() >= 0.6);
        assert_eq!(forest.n_trees(), 100);
    }

    #[test]
    fn test_dimension_mismatch_is_failure() {
        let forest = IsolationForest::fit(&normal_history(50), &config()).unwrap();
        assert!(matches!(
            forest.score(&[1.0]),
            Err(DetectError::DetectorFailure { .. })
        ));
    }

    #[test]
    fn test_extreme_values_do_not_break_fitting() {
        // The spread of the first dimension overflows to infinity
        let history: Vec<Vec<f64>> = normal_history(40)
            .into_iter()
            .enumerate()
            .map(|(i, mut v)| {
                v[0] = if i % 2 == 0 { f64::MAX } else { -f64::MAX };
                v
            })
            .collect();

        let forest = IsolationForest::fit(&history, &config()).unwrap();
        let score = forest.score(&[f64::MAX, 100.0, 40.0]).unwrap();
        assert!(score.is_finite());
    }

    #[test]
    fn test_slot_swap_and_history_bound() {
        let slot = Arc::new(ModelSlot::new(30));
        for v in normal_history(40) {
            slot.record(v);
        }
        assert_eq!(slot.history_len(), 30);

        let detector = IsolationForestDetector::new(config(), slot.clone());
        assert_eq!(
            detector.score(&[10.0, 100.0, 40.0]),
            Err(DetectError::ModelUnavailable)
        );

        let version = detector.fit(&slot.history_snapshot()).unwrap();
        assert_eq!(version, 1);
        let before = slot.current().unwrap();
        detector.fit(&normal_history(60)).unwrap();
        let after = slot.current().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(slot.version(), 2);
        // The old handle stays usable after a swap
        assert!(before.score(&[10.0, 100.0, 40.0]).is_ok());
    }
}
