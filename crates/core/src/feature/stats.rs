//! Numeric helpers shared by the preprocessor, feature engine and detectors

/// Running mean and standard deviation
///
/// Uses Welford's online algorithm: O(1) per update and numerically stable,
/// no history is retained.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (Bessel's correction); 0 with fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard score of `value` against the accumulated samples
    pub fn z_score(&self, value: f64) -> Option<f64> {
        let std = self.std_dev();
        if self.count < 2 || std < f64::EPSILON {
            None
        } else {
            Some((value - self.mean) / std)
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation; 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Percentile with linear interpolation between closest ranks
///
/// `sorted` must already be sorted ascending.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }
}

pub fn sort_floats(values: &mut [f64]) {
    values.sort_by(|a, b| a.total_cmp(b));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stats_matches_batch() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = RunningStats::new();
        for v in values {
            stats.push(v);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        assert!((stats.std_dev() - std_dev(&values)).abs() < 1e-12);
    }

    #[test]
    fn test_running_stats_ignores_non_finite() {
        let mut stats = RunningStats::new();
        stats.push(1.0);
        stats.push(f64::NAN);
        stats.push(f64::INFINITY);
        assert_eq!(stats.count(), 1);
    }

    #[test]
    fn test_z_score_requires_spread() {
        let mut stats = RunningStats::new();
        stats.push(5.0);
        stats.push(5.0);
        assert_eq!(stats.z_score(100.0), None);
        stats.push(6.0);
        assert!(stats.z_score(100.0).unwrap() > 3.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert!((percentile(&sorted, 50.0).unwrap() - 50.5).abs() < 1e-9);
        assert!((percentile(&sorted, 99.0).unwrap() - 99.01).abs() < 1e-9);
        assert_eq!(percentile(&[], 99.0), None);
        assert_eq!(percentile(&[3.0], 95.0), Some(3.0));
    }
}
