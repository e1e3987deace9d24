//! Rule-based detection
//!
//! Stateless per-tick evaluation against the raw record and the feature
//! vector. Ratio rules only evaluate when the features they need are ready.

use std::collections::HashMap;

use crate::config::RuleConfig;
use crate::error::Result;
use crate::models::{AnomalyKind, FieldStats, Finding, Severity};

use super::{DetectionContext, Detector};

const NAME: &str = "rules";

/// Floor under baseline values used in ratios
const BASELINE_FLOOR: f64 = 1e-6;

/// Threshold rules over HTTP status, latency, volume, resources and clients
pub struct RuleDetector {
    config: RuleConfig,
}

impl RuleDetector {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    fn finding(
        &self,
        ctx: &DetectionContext<'_>,
        kind: AnomalyKind,
        severity: Severity,
        score: f64,
    ) -> Finding {
        Finding::for_record(NAME, ctx.series_key, ctx.record, kind, severity, score)
    }

    fn http_status(&self, ctx: &DetectionContext<'_>, out: &mut Vec<Finding>) {
        let Some(code) = ctx.record.status_code else {
            return;
        };
        match code {
            500..=599 => out.push(
                self.finding(ctx, AnomalyKind::Http5xx, Severity::Critical, 1.0)
                    .with_detail(format!("HTTP {code} server error")),
            ),
            400..=499 => {
                let score = match code {
                    429 => 0.7,
                    401 | 403 => 0.6,
                    _ => 0.5,
                };
                out.push(
                    self.finding(ctx, AnomalyKind::Http4xx, Severity::Warning, score)
                        .with_detail(format!("HTTP {code} client error")),
                );
            }
            _ => {}
        }
    }

    fn latency(&self, ctx: &DetectionContext<'_>, out: &mut Vec<Finding>) {
        let Some(rt) = ctx.features.response_time.as_ref() else {
            return;
        };
        let Some(baseline) = rt.baseline_mean else {
            return;
        };

        if let Some(ratio) = rt.spike_score {
            if ratio >= self.config.latency_spike_ratio {
                out.push(
                    self.finding(
                        ctx,
                        AnomalyKind::LatencySpike,
                        Severity::Warning,
                        (ratio / 4.0).min(1.0),
                    )
                    .with_detail(format!(
                        "recent mean {:.1}ms is {:.2}x baseline {:.1}ms",
                        rt.recent_mean.unwrap_or_default(),
                        ratio,
                        baseline
                    )),
                );
            }
        }

        if rt.samples >= self.config.latency_p99_min_samples
            && rt.p99 >= self.config.latency_p99_ratio * baseline.max(BASELINE_FLOOR)
        {
            out.push(
                self.finding(ctx, AnomalyKind::LatencySpike, Severity::Critical, 0.9)
                    .with_detail(format!(
                        "p99 {:.1}ms is >= {}x baseline mean {:.1}ms",
                        rt.p99, self.config.latency_p99_ratio, baseline
                    )),
            );
        }
    }

    fn volume(&self, ctx: &DetectionContext<'_>, out: &mut Vec<Finding>) {
        let features = ctx.features;
        let (Some(recent), Some(baseline)) =
            (features.rps_recent.value(), features.rps_baseline.value())
        else {
            return;
        };
        if baseline <= 0.0 {
            return;
        }
        let ratio = recent / baseline.max(BASELINE_FLOOR);

        if ratio >= self.config.rps_spike_ratio {
            out.push(
                self.finding(
                    ctx,
                    AnomalyKind::RpsSpike,
                    Severity::Warning,
                    ((ratio - 1.0) * 0.3).min(1.0),
                )
                .with_detail(format!(
                    "recent {recent:.2} rps is {ratio:.2}x baseline {baseline:.2} rps"
                )),
            );
        } else if ratio <= self.config.rps_drop_ratio {
            out.push(
                self.finding(ctx, AnomalyKind::RpsDrop, Severity::Critical, 0.8)
                    .with_detail(format!(
                        "recent {recent:.2} rps dropped to {ratio:.2}x baseline {baseline:.2} rps"
                    )),
            );
        }

        if let (Some(recent_err), Some(baseline_err)) = (
            features.error_rate_recent.value(),
            features.error_rate_baseline.value(),
        ) {
            if baseline_err < self.config.error_rate_baseline_max
                && recent_err > self.config.error_rate_recent_min
            {
                let severity = if recent_err > self.config.error_rate_critical {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                out.push(
                    self.finding(
                        ctx,
                        AnomalyKind::ErrorRateSpike,
                        severity,
                        (2.0 * recent_err).min(1.0),
                    )
                    .with_detail(format!(
                        "error rate {:.0}% vs baseline {:.0}%",
                        recent_err * 100.0,
                        baseline_err * 100.0
                    )),
                );
            }
        }
    }

    /// Shared shape of the CPU and memory rules
    #[allow(clippy::too_many_arguments)]
    fn resource(
        &self,
        ctx: &DetectionContext<'_>,
        out: &mut Vec<Finding>,
        stats: Option<&FieldStats>,
        current: Option<f64>,
        spike: (AnomalyKind, f64, f64),
        saturation: (AnomalyKind, f64),
        label: &str,
    ) {
        let (spike_kind, spike_ratio, floor_pct) = spike;
        let (saturation_kind, saturation_pct) = saturation;

        if let Some(stats) = stats {
            if let (Some(recent), Some(ratio)) = (stats.recent_mean, stats.spike_score) {
                if ratio >= spike_ratio && recent > floor_pct {
                    let severity = if recent >= self.config.resource_critical_pct {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    };
                    out.push(
                        self.finding(
                            ctx,
                            spike_kind,
                            severity,
                            (recent - floor_pct) / (100.0 - floor_pct),
                        )
                        .with_detail(format!(
                            "{label} recent mean {recent:.1}% is {ratio:.2}x baseline"
                        )),
                    );
                }
            }
        }

        if let Some(value) = current {
            if value >= saturation_pct {
                out.push(
                    self.finding(ctx, saturation_kind, Severity::Critical, 1.0)
                        .with_detail(format!("{label} at {value:.1}%")),
                );
            }
        }
    }

    fn security(&self, ctx: &DetectionContext<'_>, out: &mut Vec<Finding>) {
        if let Some(client) = ctx.record.client_addr.as_deref() {
            let from_client: Vec<_> = ctx
                .window
                .full()
                .filter(|r| r.client_addr.as_deref() == Some(client))
                .collect();

            let count = from_client.len();
            if count >= self.config.ip_repeat_threshold {
                out.push(
                    self.finding(
                        ctx,
                        AnomalyKind::IpRepeatAbuse,
                        Severity::Warning,
                        count as f64 / 100.0,
                    )
                    .with_source(client)
                    .with_detail(format!("{count} requests from {client} in window")),
                );
            }

            let burst = self.config.burst_threshold;
            if count >= burst {
                let last = &from_client[count - burst..];
                let span = (last[burst - 1].timestamp - last[0].timestamp).num_milliseconds()
                    as f64
                    / 1000.0;
                if span <= 0.0 {
                    // Identical timestamps: an unbounded rate
                    out.push(
                        self.finding(ctx, AnomalyKind::BurstAbuse, Severity::Warning, 1.0)
                            .with_source(client)
                            .with_detail(format!(
                                "{burst} simultaneous requests from {client}"
                            )),
                    );
                } else if span < self.config.burst_window_secs as f64 {
                    let rps = burst as f64 / span;
                    if rps >= self.config.burst_min_rps {
                        out.push(
                            self.finding(ctx, AnomalyKind::BurstAbuse, Severity::Warning, rps / 10.0)
                                .with_source(client)
                                .with_detail(format!(
                                    "{burst} requests from {client} in {span:.2}s ({rps:.1} rps)"
                                )),
                        );
                    }
                }
            }
        }

        if let Some(endpoint) = ctx.record.endpoint.as_deref() {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for r in ctx.window.last_n(self.config.endpoint_lookback) {
                if let Some(ep) = r.endpoint.as_deref() {
                    *counts.entry(ep).or_default() += 1;
                }
            }
            let count = counts.get(endpoint).copied().unwrap_or(0);
            if count >= self.config.endpoint_threshold {
                out.push(
                    self.finding(
                        ctx,
                        AnomalyKind::EndpointConcentration,
                        Severity::Warning,
                        count as f64 / self.config.endpoint_lookback as f64,
                    )
                    .with_source(endpoint)
                    .with_detail(format!(
                        "{count} of the last {} requests hit {endpoint}",
                        self.config.endpoint_lookback
                    )),
                );
            }
        }
    }
}

impl Detector for RuleDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>) -> Result<Vec<Finding>> {
        let mut out = Vec::new();
        self.http_status(ctx, &mut out);
        self.latency(ctx, &mut out);
        self.volume(ctx, &mut out);
        self.resource(
            ctx,
            &mut out,
            ctx.features.cpu.as_ref(),
            ctx.record.cpu_pct,
            (
                AnomalyKind::CpuSpike,
                self.config.cpu_spike_ratio,
                self.config.cpu_spike_min_pct,
            ),
            (AnomalyKind::CpuSaturation, self.config.cpu_saturation_pct),
            "cpu",
        );
        self.resource(
            ctx,
            &mut out,
            ctx.features.mem.as_ref(),
            ctx.record.mem_pct,
            (
                AnomalyKind::MemLeak,
                self.config.mem_leak_ratio,
                self.config.mem_leak_min_pct,
            ),
            (AnomalyKind::MemOomRisk, self.config.mem_oom_pct),
            "memory",
        );
        self.security(ctx, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfig, WindowConfig};
    use crate::feature::FeatureEngine;
    use crate::models::EventRecord;
    use crate::processing::Window;
    use chrono::{Duration, TimeZone, Utc};

    fn record(i: i64) -> EventRecord {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        EventRecord::new("api", base + Duration::milliseconds(i * 100))
    }

    fn run(records: Vec<EventRecord>) -> Vec<Finding> {
        let mut window = Window::new(&WindowConfig::default());
        let mut last = None;
        for r in records {
            last = Some(window.append(r));
        }
        let record = last.unwrap();
        let snapshot = window.snapshot();
        let features = FeatureEngine::new(FeatureConfig::default()).compute("api", &snapshot);
        let ctx = DetectionContext {
            series_key: "api",
            record: &record,
            features: &features,
            window: &snapshot,
        };
        RuleDetector::new(RuleConfig::default()).detect(&ctx).unwrap()
    }

    fn kinds(findings: &[Finding]) -> Vec<AnomalyKind> {
        findings.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_503_is_critical_without_window() {
        let mut r = record(0);
        r.status_code = Some(503);
        let findings = run(vec![r]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, AnomalyKind::Http5xx);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].score, 1.0);
    }

    #[test]
    fn test_4xx_scores_by_code() {
        for (code, score) in [(429, 0.7), (403, 0.6), (401, 0.6), (404, 0.5)] {
            let mut r = record(0);
            r.status_code = Some(code);
            let findings = run(vec![r]);
            assert_eq!(findings[0].kind, AnomalyKind::Http4xx);
            assert_eq!(findings[0].severity, Severity::Warning);
            assert_eq!(findings[0].score, score, "code {code}");
        }
    }

    fn cpu_series(baseline: f64, recent: f64) -> Vec<EventRecord> {
        (0..20)
            .map(|i| {
                let mut r = record(i);
                r.cpu_pct = Some(if i < 16 { baseline } else { recent });
                r
            })
            .collect()
    }

    #[test]
    fn test_cpu_spike_formula() {
        let findings = run(cpu_series(40.0, 75.0));
        let spike = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::CpuSpike)
            .expect("cpu spike");
        assert!((spike.score - 5.0 / 30.0).abs() < 1e-4);
        assert_eq!(spike.severity, Severity::Warning);
    }

    #[test]
    fn test_cpu_spike_requires_absolute_level() {
        let findings = run(cpu_series(40.0, 60.0));
        assert!(findings.is_empty(), "got {:?}", kinds(&findings));
    }

    #[test]
    fn test_cpu_saturation_and_critical_spike() {
        let findings = run(cpu_series(40.0, 96.0));
        let k = kinds(&findings);
        assert!(k.contains(&AnomalyKind::CpuSaturation));
        let spike = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::CpuSpike)
            .unwrap();
        assert_eq!(spike.severity, Severity::Critical);
    }

    #[test]
    fn test_memory_leak_and_oom() {
        let records: Vec<_> = (0..20)
            .map(|i| {
                let mut r = record(i);
                r.mem_pct = Some(if i < 16 { 70.0 } else { 90.0 });
                r
            })
            .collect();
        let findings = run(records);
        let leak = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::MemLeak)
            .unwrap();
        assert!((leak.score - 0.5).abs() < 1e-9);
        assert!(!kinds(&findings).contains(&AnomalyKind::MemOomRisk));
    }

    #[test]
    fn test_latency_spike_and_p99() {
        let records: Vec<_> = (0..40)
            .map(|i| {
                let mut r = record(i);
                r.response_time_ms = Some(if i < 32 { 100.0 } else { 500.0 });
                r
            })
            .collect();
        let findings = run(records);
        let latency: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == AnomalyKind::LatencySpike)
            .collect();
        assert_eq!(latency.len(), 2);
        assert!(latency
            .iter()
            .any(|f| f.severity == Severity::Warning && f.score == 1.0));
        assert!(latency
            .iter()
            .any(|f| f.severity == Severity::Critical && f.score == 0.9));
    }

    #[test]
    fn test_rps_drop() {
        // 80 records at 10 rps, then 20 records at 1 rps
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut records = Vec::new();
        for i in 0..80 {
            records.push(EventRecord::new("api", base + Duration::milliseconds(i * 100)));
        }
        for i in 1..=20 {
            records.push(EventRecord::new(
                "api",
                base + Duration::milliseconds(7_900 + i * 1000),
            ));
        }
        let findings = run(records);
        let drop = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::RpsDrop)
            .expect("rps drop");
        assert_eq!(drop.severity, Severity::Critical);
        assert_eq!(drop.score, 0.8);
    }

    #[test]
    fn test_steady_stream_is_quiet() {
        let records = (0..100)
            .map(|i| {
                let mut r = record(i);
                r.status_code = Some(200);
                r.response_time_ms = Some(120.0);
                r.cpu_pct = Some(35.0);
                r.mem_pct = Some(50.0);
                r
            })
            .collect();
        assert!(run(records).is_empty());
    }

    #[test]
    fn test_ip_repeat_and_burst() {
        let records = (0..60)
            .map(|i| {
                let mut r = record(i);
                r.client_addr = Some("10.1.1.1".into());
                r
            })
            .collect();
        let findings = run(records);
        let repeat = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::IpRepeatAbuse)
            .unwrap();
        assert_eq!(repeat.source_id, "10.1.1.1");
        assert!((repeat.score - 0.6).abs() < 1e-9);

        let burst = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::BurstAbuse)
            .unwrap();
        // 10 requests in 0.9s
        assert_eq!(burst.score, 1.0);
    }

    #[test]
    fn test_simultaneous_requests_are_a_burst() {
        let records = (0..12)
            .map(|_| {
                let mut r = record(0);
                r.client_addr = Some("10.2.2.2".into());
                r
            })
            .collect();
        let findings = run(records);
        let burst = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::BurstAbuse)
            .unwrap();
        assert_eq!(burst.source_id, "10.2.2.2");
        assert_eq!(burst.score, 1.0);
        assert!(burst.detail.contains("simultaneous"));
    }

    #[test]
    fn test_endpoint_concentration() {
        let records = (0..50)
            .map(|i| {
                let mut r = record(i);
                r.endpoint = Some(if i % 5 == 0 { "/health" } else { "/login" }.into());
                r
            })
            .collect();
        let findings = run(records);
        let hit = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::EndpointConcentration)
            .unwrap();
        assert_eq!(hit.source_id, "/login");
        assert!((hit.score - 0.8).abs() < 1e-9);
    }
}
