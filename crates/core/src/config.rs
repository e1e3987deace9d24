//! Pipeline configuration
//!
//! [`PipelineConfig`] is the single explicit configuration object handed to
//! [`crate::pipeline::Pipeline::new`]. Every field has a default so partial
//! TOML files and environment overrides deserialize cleanly.

use serde::{Deserialize, Serialize};

use crate::error::{DetectError, Result};

/// Detection pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub rules: RuleConfig,
    #[serde(default)]
    pub zscore: ZScoreConfig,
    #[serde(default)]
    pub isolation_forest: IsolationForestConfig,
    #[serde(default)]
    pub changepoint: ChangePointConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl PipelineConfig {
    /// Reject invalid thresholds before any record is accepted
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.preprocess.validate()?;
        self.features.validate()?;
        self.rules.validate()?;
        self.zscore.validate()?;
        self.isolation_forest.validate()?;
        self.changepoint.validate()?;
        self.alerts.validate()?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> DetectError {
    DetectError::Config(msg.into())
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be a positive number, got {value}")))
    }
}

fn require_fraction(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be in (0, 1), got {value}")))
    }
}

/// Rolling window sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Count cap
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Time cap, relative to the newest record
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Share of the window treated as the recent sub-window
    #[serde(default = "default_recent_fraction")]
    pub recent_fraction: f64,

    /// Fixed recent sub-window size; takes precedence over the fraction
    #[serde(default)]
    pub recent_count: Option<usize>,
}

fn default_max_records() -> usize {
    1000
}

fn default_max_age_secs() -> u64 {
    300
}

fn default_recent_fraction() -> f64 {
    0.2
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_age_secs: default_max_age_secs(),
            recent_fraction: default_recent_fraction(),
            recent_count: None,
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.max_records < 2 {
            return Err(invalid("window.max_records must be at least 2"));
        }
        if self.max_age_secs == 0 {
            return Err(invalid("window.max_age_secs must be greater than 0"));
        }
        require_fraction("window.recent_fraction", self.recent_fraction)?;
        if let Some(k) = self.recent_count {
            if k == 0 || k >= self.max_records {
                return Err(invalid(format!(
                    "window.recent_count must be in [1, {}), got {k}",
                    self.max_records
                )));
            }
        }
        Ok(())
    }
}

/// How numeric outliers are clipped before storage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipMode {
    Off,
    /// Fixed per-field bounds
    Range,
    /// N standard deviations from the running per-series mean
    Sigma,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Preprocessor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_clip_mode")]
    pub clip_mode: ClipMode,

    #[serde(default = "default_response_time_bounds")]
    pub response_time_bounds: Bounds,

    #[serde(default = "default_percent_bounds")]
    pub cpu_bounds: Bounds,

    #[serde(default = "default_percent_bounds")]
    pub mem_bounds: Bounds,

    #[serde(default = "default_clip_sigma")]
    pub clip_sigma: f64,

    /// Samples needed before sigma clipping engages
    #[serde(default = "default_clip_min_samples")]
    pub clip_min_samples: u64,

    /// Replace numeric fields with their EMA before storage
    #[serde(default)]
    pub smoothing: bool,

    #[serde(default = "default_smoothing_span")]
    pub smoothing_span: usize,
}

fn default_clip_mode() -> ClipMode {
    ClipMode::Range
}

fn default_response_time_bounds() -> Bounds {
    Bounds::new(0.0, 60_000.0)
}

fn default_percent_bounds() -> Bounds {
    Bounds::new(0.0, 100.0)
}

fn default_clip_sigma() -> f64 {
    4.0
}

fn default_clip_min_samples() -> u64 {
    10
}

fn default_smoothing_span() -> usize {
    5
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            clip_mode: default_clip_mode(),
            response_time_bounds: default_response_time_bounds(),
            cpu_bounds: default_percent_bounds(),
            mem_bounds: default_percent_bounds(),
            clip_sigma: default_clip_sigma(),
            clip_min_samples: default_clip_min_samples(),
            smoothing: false,
            smoothing_span: default_smoothing_span(),
        }
    }
}

impl PreprocessConfig {
    /// EMA factor derived from the smoothing span
    pub fn smoothing_alpha(&self) -> f64 {
        2.0 / (self.smoothing_span as f64 + 1.0)
    }

    fn validate(&self) -> Result<()> {
        for (name, b) in [
            ("preprocess.response_time_bounds", self.response_time_bounds),
            ("preprocess.cpu_bounds", self.cpu_bounds),
            ("preprocess.mem_bounds", self.mem_bounds),
        ] {
            if !(b.min.is_finite() && b.max.is_finite()) || b.min >= b.max {
                return Err(invalid(format!("{name} must satisfy min < max")));
            }
        }
        require_positive("preprocess.clip_sigma", self.clip_sigma)?;
        if self.smoothing_span == 0 {
            return Err(invalid("preprocess.smoothing_span must be at least 1"));
        }
        Ok(())
    }
}

/// Feature engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// EMA smoothing factor
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Minimum recent-window samples before rate features are reported
    #[serde(default = "default_min_recent_samples")]
    pub min_recent_samples: usize,

    /// Floor applied to the baseline when computing spike scores
    #[serde(default = "default_baseline_floor")]
    pub baseline_floor: f64,
}

fn default_ema_alpha() -> f64 {
    0.3
}

fn default_min_recent_samples() -> usize {
    3
}

fn default_baseline_floor() -> f64 {
    1e-6
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            min_recent_samples: default_min_recent_samples(),
            baseline_floor: default_baseline_floor(),
        }
    }
}

impl FeatureConfig {
    fn validate(&self) -> Result<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(invalid(format!(
                "features.ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if self.min_recent_samples == 0 {
            return Err(invalid("features.min_recent_samples must be at least 1"));
        }
        require_positive("features.baseline_floor", self.baseline_floor)
    }
}

/// Thresholds for the rule-based detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_latency_spike_ratio")]
    pub latency_spike_ratio: f64,
    #[serde(default = "default_latency_p99_ratio")]
    pub latency_p99_ratio: f64,
    #[serde(default = "default_latency_p99_min_samples")]
    pub latency_p99_min_samples: usize,

    #[serde(default = "default_rps_spike_ratio")]
    pub rps_spike_ratio: f64,
    #[serde(default = "default_rps_drop_ratio")]
    pub rps_drop_ratio: f64,

    #[serde(default = "default_error_rate_baseline_max")]
    pub error_rate_baseline_max: f64,
    #[serde(default = "default_error_rate_recent_min")]
    pub error_rate_recent_min: f64,
    #[serde(default = "default_error_rate_critical")]
    pub error_rate_critical: f64,

    #[serde(default = "default_cpu_spike_ratio")]
    pub cpu_spike_ratio: f64,
    #[serde(default = "default_cpu_spike_min_pct")]
    pub cpu_spike_min_pct: f64,
    #[serde(default = "default_saturation_pct")]
    pub cpu_saturation_pct: f64,

    #[serde(default = "default_mem_leak_ratio")]
    pub mem_leak_ratio: f64,
    #[serde(default = "default_mem_leak_min_pct")]
    pub mem_leak_min_pct: f64,
    #[serde(default = "default_saturation_pct")]
    pub mem_oom_pct: f64,

    /// Resource spikes at or above this level are critical
    #[serde(default = "default_resource_critical_pct")]
    pub resource_critical_pct: f64,

    #[serde(default = "default_ip_repeat_threshold")]
    pub ip_repeat_threshold: usize,
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: usize,
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
    #[serde(default = "default_burst_min_rps")]
    pub burst_min_rps: f64,
    #[serde(default = "default_endpoint_lookback")]
    pub endpoint_lookback: usize,
    #[serde(default = "default_endpoint_threshold")]
    pub endpoint_threshold: usize,
}

fn default_latency_spike_ratio() -> f64 {
    2.0
}
fn default_latency_p99_ratio() -> f64 {
    3.0
}
fn default_latency_p99_min_samples() -> usize {
    20
}
fn default_rps_spike_ratio() -> f64 {
    2.0
}
fn default_rps_drop_ratio() -> f64 {
    0.3
}
fn default_error_rate_baseline_max() -> f64 {
    0.1
}
fn default_error_rate_recent_min() -> f64 {
    0.2
}
fn default_error_rate_critical() -> f64 {
    0.5
}
fn default_cpu_spike_ratio() -> f64 {
    1.5
}
fn default_cpu_spike_min_pct() -> f64 {
    70.0
}
fn default_saturation_pct() -> f64 {
    95.0
}
fn default_mem_leak_ratio() -> f64 {
    1.2
}
fn default_mem_leak_min_pct() -> f64 {
    80.0
}
fn default_resource_critical_pct() -> f64 {
    90.0
}
fn default_ip_repeat_threshold() -> usize {
    50
}
fn default_burst_threshold() -> usize {
    10
}
fn default_burst_window_secs() -> u64 {
    10
}
fn default_burst_min_rps() -> f64 {
    5.0
}
fn default_endpoint_lookback() -> usize {
    50
}
fn default_endpoint_threshold() -> usize {
    30
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            latency_spike_ratio: default_latency_spike_ratio(),
            latency_p99_ratio: default_latency_p99_ratio(),
            latency_p99_min_samples: default_latency_p99_min_samples(),
            rps_spike_ratio: default_rps_spike_ratio(),
            rps_drop_ratio: default_rps_drop_ratio(),
            error_rate_baseline_max: default_error_rate_baseline_max(),
            error_rate_recent_min: default_error_rate_recent_min(),
            error_rate_critical: default_error_rate_critical(),
            cpu_spike_ratio: default_cpu_spike_ratio(),
            cpu_spike_min_pct: default_cpu_spike_min_pct(),
            cpu_saturation_pct: default_saturation_pct(),
            mem_leak_ratio: default_mem_leak_ratio(),
            mem_leak_min_pct: default_mem_leak_min_pct(),
            mem_oom_pct: default_saturation_pct(),
            resource_critical_pct: default_resource_critical_pct(),
            ip_repeat_threshold: default_ip_repeat_threshold(),
            burst_threshold: default_burst_threshold(),
            burst_window_secs: default_burst_window_secs(),
            burst_min_rps: default_burst_min_rps(),
            endpoint_lookback: default_endpoint_lookback(),
            endpoint_threshold: default_endpoint_threshold(),
        }
    }
}

impl RuleConfig {
    fn validate(&self) -> Result<()> {
        require_positive("rules.latency_spike_ratio", self.latency_spike_ratio)?;
        require_positive("rules.latency_p99_ratio", self.latency_p99_ratio)?;
        require_positive("rules.rps_spike_ratio", self.rps_spike_ratio)?;
        require_fraction("rules.rps_drop_ratio", self.rps_drop_ratio)?;
        require_fraction("rules.error_rate_baseline_max", self.error_rate_baseline_max)?;
        require_fraction("rules.error_rate_recent_min", self.error_rate_recent_min)?;
        require_fraction("rules.error_rate_critical", self.error_rate_critical)?;
        require_positive("rules.cpu_spike_ratio", self.cpu_spike_ratio)?;
        require_positive("rules.mem_leak_ratio", self.mem_leak_ratio)?;
        if self.cpu_spike_min_pct >= 100.0 || self.mem_leak_min_pct >= 100.0 {
            return Err(invalid("resource spike floors must be below 100%"));
        }
        if self.burst_window_secs == 0 {
            return Err(invalid("rules.burst_window_secs must be greater than 0"));
        }
        if self.endpoint_threshold == 0 || self.endpoint_threshold > self.endpoint_lookback {
            return Err(invalid(
                "rules.endpoint_threshold must be in [1, endpoint_lookback]",
            ));
        }
        if self.ip_repeat_threshold == 0 || self.burst_threshold == 0 {
            return Err(invalid("security rule thresholds must be at least 1"));
        }
        Ok(())
    }
}

/// Z-score detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZScoreConfig {
    #[serde(default = "default_zscore_threshold")]
    pub threshold: f64,
    #[serde(default = "default_zscore_critical")]
    pub critical_threshold: f64,
    #[serde(default = "default_zscore_min_samples")]
    pub min_samples: u64,
}

fn default_zscore_threshold() -> f64 {
    3.0
}

fn default_zscore_critical() -> f64 {
    4.0
}

fn default_zscore_min_samples() -> u64 {
    3
}

impl Default for ZScoreConfig {
    fn default() -> Self {
        Self {
            threshold: default_zscore_threshold(),
            critical_threshold: default_zscore_critical(),
            min_samples: default_zscore_min_samples(),
        }
    }
}

impl ZScoreConfig {
    fn validate(&self) -> Result<()> {
        require_positive("zscore.threshold", self.threshold)?;
        if self.critical_threshold < self.threshold {
            return Err(invalid(
                "zscore.critical_threshold must not be below zscore.threshold",
            ));
        }
        if self.min_samples < 2 {
            return Err(invalid("zscore.min_samples must be at least 2"));
        }
        Ok(())
    }
}

/// Isolation forest settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_contamination")]
    pub contamination: f64,
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,
    /// Feature vectors retained per series for retraining
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_retrain_interval_secs")]
    pub retrain_interval_secs: u64,
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    #[serde(default = "default_iforest_critical")]
    pub critical_score: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_true() -> bool {
    true
}
fn default_n_trees() -> usize {
    100
}
fn default_max_samples() -> usize {
    256
}
fn default_contamination() -> f64 {
    0.1
}
fn default_min_training_samples() -> usize {
    20
}
fn default_history_size() -> usize {
    1000
}
fn default_retrain_interval_secs() -> u64 {
    60
}
fn default_score_floor() -> f64 {
    0.6
}
fn default_iforest_critical() -> f64 {
    0.8
}
fn default_seed() -> u64 {
    42
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            n_trees: default_n_trees(),
            max_samples: default_max_samples(),
            contamination: default_contamination(),
            min_training_samples: default_min_training_samples(),
            history_size: default_history_size(),
            retrain_interval_secs: default_retrain_interval_secs(),
            score_floor: default_score_floor(),
            critical_score: default_iforest_critical(),
            seed: default_seed(),
        }
    }
}

impl IsolationForestConfig {
    fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(invalid("isolation_forest.n_trees must be at least 1"));
        }
        if self.max_samples < 2 {
            return Err(invalid("isolation_forest.max_samples must be at least 2"));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(invalid(format!(
                "isolation_forest.contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.min_training_samples < 2 {
            return Err(invalid(
                "isolation_forest.min_training_samples must be at least 2",
            ));
        }
        if self.history_size < self.min_training_samples {
            return Err(invalid(
                "isolation_forest.history_size must hold at least min_training_samples",
            ));
        }
        if self.retrain_interval_secs == 0 {
            return Err(invalid(
                "isolation_forest.retrain_interval_secs must be greater than 0",
            ));
        }
        require_fraction("isolation_forest.score_floor", self.score_floor)?;
        require_fraction("isolation_forest.critical_score", self.critical_score)
    }
}

/// Change-point detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePointConfig {
    #[serde(default = "default_changepoint_window")]
    pub window: usize,
    #[serde(default = "default_changepoint_threshold")]
    pub threshold: f64,
    #[serde(default = "default_min_change")]
    pub min_change: f64,
    /// After/before variance ratio that counts as a volatility shift
    #[serde(default = "default_variance_ratio")]
    pub variance_ratio: f64,
}

fn default_changepoint_window() -> usize {
    20
}

fn default_changepoint_threshold() -> f64 {
    3.0
}

fn default_min_change() -> f64 {
    0.2
}

fn default_variance_ratio() -> f64 {
    4.0
}

impl Default for ChangePointConfig {
    fn default() -> Self {
        Self {
            window: default_changepoint_window(),
            threshold: default_changepoint_threshold(),
            min_change: default_min_change(),
            variance_ratio: default_variance_ratio(),
        }
    }
}

impl ChangePointConfig {
    fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(invalid("changepoint.window must be at least 2"));
        }
        require_positive("changepoint.threshold", self.threshold)?;
        if !(self.min_change.is_finite() && self.min_change >= 0.0) {
            return Err(invalid("changepoint.min_change must be non-negative"));
        }
        if !(self.variance_ratio.is_finite() && self.variance_ratio > 1.0) {
            return Err(invalid("changepoint.variance_ratio must be greater than 1"));
        }
        Ok(())
    }
}

/// Alert manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,
    #[serde(default = "default_history_max_age_secs")]
    pub history_max_age_secs: u64,
    /// Capacity of the live alert broadcast channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_dedup_window_secs() -> u64 {
    30
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_history_max_entries() -> usize {
    1000
}
fn default_history_max_age_secs() -> u64 {
    3600
}
fn default_channel_capacity() -> usize {
    1024
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            history_max_entries: default_history_max_entries(),
            history_max_age_secs: default_history_max_age_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AlertConfig {
    fn validate(&self) -> Result<()> {
        if self.cooldown_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(invalid(
                "alerts.cooldown_secs and alerts.sweep_interval_secs must be greater than 0",
            ));
        }
        if self.history_max_entries == 0 || self.channel_capacity == 0 {
            return Err(invalid(
                "alerts.history_max_entries and alerts.channel_capacity must be at least 1",
            ));
        }
        if self.history_max_age_secs == 0 {
            return Err(invalid("alerts.history_max_age_secs must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window.recent_fraction, 0.2);
        assert_eq!(config.zscore.threshold, 3.0);
        assert_eq!(config.isolation_forest.n_trees, 100);
        assert_eq!(config.alerts.dedup_window_secs, 30);
        assert_eq!(config.alerts.cooldown_secs, 60);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"zscore": {"threshold": 4.5}, "window": {"recent_count": 10}}"#)
                .unwrap();
        assert_eq!(config.zscore.threshold, 4.5);
        assert_eq!(config.zscore.min_samples, 3);
        assert_eq!(config.window.recent_count, Some(10));
        assert_eq!(config.window.max_records, 1000);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let mut config = PipelineConfig::default();
        config.window.recent_fraction = 1.5;
        assert!(matches!(config.validate(), Err(DetectError::Config(_))));

        let mut config = PipelineConfig::default();
        config.isolation_forest.contamination = 0.0;
        assert!(matches!(config.validate(), Err(DetectError::Config(_))));

        let mut config = PipelineConfig::default();
        config.zscore.critical_threshold = 2.0;
        assert!(matches!(config.validate(), Err(DetectError::Config(_))));
    }

    #[test]
    fn test_recent_count_must_fit_window() {
        let mut config = PipelineConfig::default();
        config.window.max_records = 10;
        config.window.recent_count = Some(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_smoothing_alpha_from_span() {
        let config = PreprocessConfig::default();
        assert!((config.smoothing_alpha() - 1.0 / 3.0).abs() < 1e-12);
    }
}
