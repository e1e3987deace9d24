//! Anomaly detection
//!
//! This module provides:
//! - Rule-based thresholds (HTTP status, latency, RPS, resources, security)
//! - Z-score outliers over running statistics
//! - Isolation forest scoring of feature vectors
//! - Two-window change-point detection
//! - The manager that runs every detector per tick with failure isolation

pub mod changepoint;
pub mod iforest;
pub mod manager;
pub mod rules;
pub mod zscore;

use crate::error::Result;
use crate::models::{EventRecord, FeatureVector, Finding};
use crate::processing::WindowSnapshot;

pub use changepoint::{ChangePoint, ChangePointDetector, ShiftKind, TwoWindowTest};
pub use iforest::{IsolationForest, IsolationForestDetector, ModelSlot};
pub use manager::DetectorManager;
pub use rules::RuleDetector;
pub use zscore::ZScoreDetector;

/// Everything a detector may look at for one tick
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub series_key: &'a str,
    pub record: &'a EventRecord,
    pub features: &'a FeatureVector,
    pub window: &'a WindowSnapshot<'a>,
}

/// A single member of the detector set
///
/// Detectors may keep per-series state; the pipeline guarantees a detector
/// instance is only driven by one tick at a time.
pub trait Detector: Send {
    fn name(&self) -> &'static str;

    /// Evaluate one tick
    ///
    /// Returning [`crate::DetectError::InsufficientData`] or
    /// [`crate::DetectError::ModelUnavailable`] means "skip quietly".
    fn detect(&mut self, ctx: &DetectionContext<'_>) -> Result<Vec<Finding>>;
}
