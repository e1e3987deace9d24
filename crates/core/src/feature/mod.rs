//! Feature derivation
//!
//! - `engine`: per-tick feature vectors from a window snapshot
//! - `stats`: running and batch statistics shared across the pipeline

pub mod engine;
pub mod stats;

pub use engine::FeatureEngine;
pub use stats::RunningStats;
