//! Error taxonomy for the detection pipeline
//!
//! Only [`DetectError::Config`] is fatal for a pipeline instance. Everything
//! else degrades to "no finding this tick" for the affected detector or field.

use thiserror::Error;

/// Errors raised inside the detection pipeline
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    /// Not enough samples yet; the caller must skip, not fail
    #[error("insufficient data: need {need} samples, have {have}")]
    InsufficientData { have: usize, need: usize },

    /// A field could not be parsed; it is treated as absent
    #[error("malformed field '{field}': {reason}")]
    MalformedRecord { field: String, reason: String },

    /// A single detector failed internally; isolated to that detector
    #[error("detector '{detector}' failed: {reason}")]
    DetectorFailure { detector: String, reason: String },

    /// The ML detector has no published model yet
    #[error("no model has been trained yet")]
    ModelUnavailable,

    /// Invalid configuration detected at start-up
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DetectError {
    pub fn insufficient(have: usize, need: usize) -> Self {
        DetectError::InsufficientData { have, need }
    }

    pub fn failure(detector: impl Into<String>, reason: impl Into<String>) -> Self {
        DetectError::DetectorFailure {
            detector: detector.into(),
            reason: reason.into(),
        }
    }

    /// True for conditions that mean "skip quietly" rather than "something broke"
    pub fn is_insufficient(&self) -> bool {
        matches!(
            self,
            DetectError::InsufficientData { .. } | DetectError::ModelUnavailable
        )
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;
