//! Detector orchestration
//!
//! Runs the whole detector set for one tick and merges their findings. A
//! failing or panicking detector is logged, counted and skipped; it never
//! stops the others or the tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::models::Finding;
use crate::observability::{PipelineMetrics, StructuredLogger};

use super::{
    ChangePointDetector, DetectionContext, Detector, IsolationForestDetector, ModelSlot,
    RuleDetector, ZScoreDetector,
};

pub struct DetectorManager {
    detectors: Vec<Box<dyn Detector>>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl DetectorManager {
    pub fn new(
        detectors: Vec<Box<dyn Detector>>,
        metrics: PipelineMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            detectors,
            metrics,
            logger,
        }
    }

    /// The standard detector set for one series
    pub fn standard(
        config: &PipelineConfig,
        model: Arc<ModelSlot>,
        metrics: PipelineMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(RuleDetector::new(config.rules.clone())),
            Box::new(ZScoreDetector::new(config.zscore.clone())),
            Box::new(IsolationForestDetector::new(
                config.isolation_forest.clone(),
                model,
            )),
            Box::new(ChangePointDetector::new(config.changepoint.clone())),
        ];
        Self::new(detectors, metrics, logger)
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector against one tick
    pub fn run(&mut self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();

        for detector in self.detectors.iter_mut() {
            let name = detector.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| detector.detect(ctx)));

            match outcome {
                Ok(Ok(mut found)) => {
                    self.metrics.add_findings(name, found.len());
                    findings.append(&mut found);
                }
                Ok(Err(e)) if e.is_insufficient() => {
                    debug!(
                        series = %ctx.series_key,
                        detector = name,
                        reason = %e,
                        "Detector skipped"
                    );
                }
                Ok(Err(e)) => {
                    self.metrics.inc_detector_failure(name);
                    self.logger
                        .log_detector_failure(ctx.series_key, name, &e.to_string());
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    self.metrics.inc_detector_failure(name);
                    self.logger
                        .log_detector_failure(ctx.series_key, name, &reason);
                }
            }
        }

        findings
    }
}
