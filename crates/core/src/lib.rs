//! Streaming anomaly detection core
//!
//! This crate provides:
//! - Record cleaning and rolling per-series windows
//! - Feature derivation (rates, error rates, latency and resource statistics)
//! - Rule, z-score, isolation-forest and change-point detectors
//! - Alert deduplication, escalation and resolution
//! - Stream sources, health checks and observability

pub mod alert;
pub mod anomaly;
pub mod config;
pub mod error;
pub mod feature;
pub mod health;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod processing;

pub use config::PipelineConfig;
pub use error::{DetectError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{ClearedAlerts, Pipeline, PipelineHandle, PipelineRuntime, TickReport};
