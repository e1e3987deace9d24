use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::*;
use crate::config::PipelineConfig;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{AnomalyKind, AlertState, Severity};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn at_millis(ms: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(ms)
}

fn raw(value: Value) -> RawRecord {
    value.as_object().cloned().unwrap()
}

fn request(ms: i64, status: u16, response_time: f64) -> RawRecord {
    raw(json!({
        "timestamp": at_millis(ms).to_rfc3339(),
        "status_code": status,
        "response_time_ms": response_time,
    }))
}

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default(), StructuredLogger::new("test")).unwrap()
}

#[test]
fn test_steady_stream_then_server_errors() {
    let pipeline = pipeline();
    let mut events = Vec::new();

    // 10 rps, healthy, constant latency
    for i in 0..100 {
        let report = pipeline.process_at("api", &request(i * 100, 200, 120.0), t0());
        events.extend(report.events);
    }
    assert!(events.is_empty(), "steady stream raised {events:?}");

    for i in 100..110 {
        let report = pipeline.process_at("api", &request(i * 100, 500, 120.0), t0());
        events.extend(report.events);
    }

    let raised: Vec<_> = events
        .iter()
        .filter(|e| e.transition == AlertTransition::Raised)
        .collect();
    let server_errors: Vec<_> = raised
        .iter()
        .filter(|e| e.alert.kind == AnomalyKind::Http5xx)
        .collect();
    assert_eq!(server_errors.len(), 1);
    assert_eq!(server_errors[0].alert.severity, Severity::Critical);

    for event in &events {
        assert!(
            matches!(
                event.alert.kind,
                AnomalyKind::Http5xx | AnomalyKind::ErrorRateSpike
            ),
            "unexpected alert {:?}",
            event.alert.kind
        );
    }

    let active = pipeline.active_alerts();
    let http = active
        .iter()
        .find(|a| a.kind == AnomalyKind::Http5xx)
        .unwrap();
    assert_eq!(http.occurrence_count, 10);
    assert_eq!(http.state, AlertState::Active);
    // Critical alerts sort first
    assert_eq!(active[0].severity, Severity::Critical);
}

#[test]
fn test_repeated_finding_raises_once_and_resolves_once() {
    let pipeline = pipeline();
    let mut raised = 0;
    for i in 0..5 {
        let report = pipeline.process_at("api", &request(i * 1000, 503, 80.0), at_millis(i * 1000));
        raised += report
            .events
            .iter()
            .filter(|e| e.transition == AlertTransition::Raised)
            .count();
    }
    assert_eq!(raised, 1);
    assert_eq!(pipeline.active_alerts().len(), 1);

    // Not quiet long enough yet
    assert!(pipeline.sweep(at_millis(30_000)).is_empty());

    let resolved = pipeline.sweep(at_millis(4_000 + 61_000));
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].transition, AlertTransition::Resolved);
    assert_eq!(resolved[0].alert.resolved_at, Some(at_millis(65_000)));
    assert_eq!(resolved[0].alert.occurrence_count, 5);
    assert!(pipeline.active_alerts().is_empty());
    assert!(pipeline.sweep(at_millis(200_000)).is_empty());

    let history = pipeline.alert_history(t0());
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].transition, AlertTransition::Raised);
    assert_eq!(history[1].transition, AlertTransition::Resolved);
    assert_eq!(pipeline.history_stats().total, 2);
    assert_eq!(pipeline.tracked_active_alerts(), 0);
}

#[test]
fn test_lagging_stream_raises_once_across_sweeps() {
    let pipeline = pipeline();
    let lag = 120_000;
    let mut events = Vec::new();
    for i in 0..5 {
        let now = at_millis(lag + i * 1000);
        events.extend(
            pipeline
                .process_at("api", &request(i * 1000, 503, 80.0), now)
                .events,
        );
        if i == 2 {
            events.extend(pipeline.sweep(now));
        }
    }
    let count = |transition| events.iter().filter(|e| e.transition == transition).count();
    assert_eq!(count(AlertTransition::Raised), 1);
    assert_eq!(count(AlertTransition::Resolved), 0);
    assert_eq!(pipeline.active_alerts()[0].occurrence_count, 5);
}

#[test]
fn test_acknowledge_clear_and_recent_alerts() {
    let pipeline = pipeline();
    pipeline.process_at("api", &request(0, 503, 80.0), at_millis(0));
    pipeline.process_at("web", &request(0, 503, 80.0), at_millis(0));
    let active = pipeline.active_alerts();
    assert_eq!(pipeline.history_stats().unacknowledged, active.len());

    let mut rx = pipeline.subscribe();
    let target = active[0].id;
    let acked = pipeline.acknowledge(target, at_millis(1_000)).unwrap();
    assert!(acked.acknowledged);
    assert_eq!(rx.try_recv().unwrap().transition, AlertTransition::Acknowledged);

    // Repeating is idempotent and publishes nothing
    assert!(pipeline.acknowledge(target, at_millis(2_000)).is_some());
    assert!(rx.try_recv().is_err());
    assert!(pipeline.acknowledge(Uuid::new_v4(), at_millis(2_000)).is_none());
    assert_eq!(pipeline.history_stats().unacknowledged, active.len() - 1);

    let recent = pipeline.recent_alerts(1, None);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].transition, AlertTransition::Acknowledged);
    assert!(pipeline
        .recent_alerts(10, Some(Severity::Critical))
        .iter()
        .all(|e| e.alert.severity == Severity::Critical));

    let cleared = pipeline.clear_alerts(Some(Severity::Critical));
    let critical = active
        .iter()
        .filter(|a| a.severity == Severity::Critical)
        .count();
    assert_eq!(cleared.active, critical);
    assert!(cleared.history >= critical);
    assert!(pipeline
        .active_alerts()
        .iter()
        .all(|a| a.severity != Severity::Critical));
    assert_eq!(
        pipeline.tracked_active_alerts(),
        pipeline.active_alerts().len() as i64
    );

    pipeline.clear_alerts(None);
    assert!(pipeline.active_alerts().is_empty());
    assert_eq!(pipeline.history_stats().total, 0);
    assert_eq!(pipeline.tracked_active_alerts(), 0);
}

#[test]
fn test_malformed_fields_do_not_stop_the_series() {
    let pipeline = pipeline();
    let bad = raw(json!({
        "timestamp": "yesterday-ish",
        "status_code": "abc",
        "response_time_ms": "fast",
        "cpu_pct": 40.0,
    }));
    let report = pipeline.process_at("api", &bad, t0());
    assert_eq!(report.malformed.len(), 3);
    assert_eq!(report.record.timestamp, t0());
    assert_eq!(report.record.status_code, None);
    assert_eq!(report.record.response_time_ms, None);
    assert_eq!(report.record.cpu_pct, Some(40.0));

    let report = pipeline.process_at("api", &request(1000, 200, 90.0), t0());
    assert!(report.malformed.is_empty());
    assert_eq!(report.record.sequence, 1);
    assert_eq!(pipeline.window_stats()[0].size, 2);
}

#[test]
fn test_series_are_isolated() {
    let pipeline = pipeline();
    for i in 0..5 {
        pipeline.process_at("broken", &request(i * 100, 500, 100.0), t0());
        pipeline.process_at("fine", &request(i * 100, 200, 100.0), t0());
    }

    assert_eq!(pipeline.series_keys(), vec!["broken", "fine"]);
    let active = pipeline.active_alerts();
    assert!(!active.is_empty());
    assert!(active.iter().all(|a| a.series_key == "broken"));
    assert_eq!(pipeline.tracked_active_alerts(), active.len() as i64);

    let features = pipeline.latest_features("fine").unwrap();
    assert_eq!(features.sample_count, 5);
    assert!(pipeline.latest_features("missing").is_none());

    assert!(pipeline.clear("broken"));
    assert!(!pipeline.clear("broken"));
    assert_eq!(pipeline.series_keys(), vec!["fine"]);
    assert!(pipeline.active_alerts().is_empty());
    // Dropping the series takes its alerts out of the gauge
    assert_eq!(pipeline.tracked_active_alerts(), 0);
}

#[test]
fn test_invalid_config_rejected_up_front() {
    let mut config = PipelineConfig::default();
    config.window.max_records = 0;
    let result = Pipeline::new(config, StructuredLogger::new("test"));
    assert!(matches!(result, Err(DetectError::Config(_))));
}

#[test]
fn test_train_model_and_stable_scoring() {
    let pipeline = pipeline();
    assert!(pipeline.train_model("api").unwrap_err().is_insufficient());

    for i in 0..120 {
        let latency = 100.0 + (i % 7) as f64 * 5.0;
        pipeline.process_at("api", &request(i * 100, 200, latency), t0());
    }
    let version = pipeline.train_model("api").unwrap();
    assert_eq!(version, 1);

    let (_, slot) = pipeline
        .model_slots()
        .into_iter()
        .find(|(key, _)| key == "api")
        .unwrap();
    let model = slot.current().unwrap();
    let point = pipeline.latest_features("api").unwrap().ml_vector();
    let first = model.score(&point).unwrap();
    let second = model.score(&point).unwrap();
    assert_eq!(first, second);
    assert!((0.0..=1.0).contains(&first));

    // Scoring now runs on every tick without failing the series
    let report = pipeline.process_at("api", &request(12_000, 200, 110.0), t0());
    assert_eq!(report.record.sequence, 120);
}

#[test]
fn test_subscribers_see_published_events() {
    let pipeline = pipeline();
    let mut rx = pipeline.subscribe();
    pipeline.process_at("api", &request(0, 502, 100.0), t0());
    let event = rx.try_recv().unwrap();
    assert_eq!(event.transition, AlertTransition::Raised);
    assert_eq!(event.alert.kind, AnomalyKind::Http5xx);
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_runtime_processes_in_order_and_shuts_down() {
    let pipeline = Arc::new(pipeline());
    let health = HealthRegistry::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = PipelineRuntime::spawn(pipeline.clone(), health.clone(), &shutdown_tx);
    let handle = runtime.handle();

    for i in 0..50 {
        handle.submit("a", request(i * 100, 200, 100.0));
        handle.submit("b", request(i * 100, 200, 100.0));
    }

    let p = pipeline.clone();
    wait_for(move || {
        let stats = p.window_stats();
        stats.len() == 2 && stats.iter().all(|s| s.total_appended == 50)
    })
    .await;

    for stats in pipeline.window_stats() {
        assert_eq!(stats.oldest, Some(t0()));
        assert_eq!(stats.newest, Some(at_millis(4_900)));
    }

    shutdown_tx.send(()).unwrap();
    runtime.join().await;

    let health = health.health().await;
    assert_eq!(
        health.components[components::PIPELINE].status,
        ComponentStatus::Unhealthy
    );
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_runtime_streams_alert_events() {
    let pipeline = Arc::new(pipeline());
    let mut events = pipeline.subscribe();
    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = PipelineRuntime::spawn(pipeline.clone(), HealthRegistry::new(), &shutdown_tx);

    runtime.handle().submit("api", raw(json!({ "status_code": 503 })));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.alert.kind, AnomalyKind::Http5xx);
    assert_eq!(event.alert.series_key, "api");

    shutdown_tx.send(()).unwrap();
    runtime.join().await;
}
