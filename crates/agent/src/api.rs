//! HTTP API: health, metrics and the read-only pipeline views

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use streamwatch_core::alert::HistoryStats;
use streamwatch_core::health::{ComponentStatus, HealthRegistry};
use streamwatch_core::{Pipeline, PipelineHandle, Severity};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub handle: PipelineHandle,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        handle: PipelineHandle,
        health_registry: HealthRegistry,
    ) -> Self {
        Self {
            pipeline,
            handle,
            health_registry,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 otherwise
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance: String,
    pub version: &'static str,
    pub status: ComponentStatus,
    pub series: usize,
    pub active_alerts: usize,
    pub history: HistoryStats,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let health = state.health_registry.health().await;
    Json(StatusResponse {
        instance: state.pipeline.logger().instance().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        status: health.status,
        series: state.pipeline.series_keys().len(),
        active_alerts: state.pipeline.active_alerts().len(),
        history: state.pipeline.history_stats(),
    })
}

async fn list_series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.window_stats())
}

async fn series_features(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .pipeline
        .latest_features(&series)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown series '{series}'")))
}

async fn submit_record(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let Value::Object(raw) = body else {
        return Err(ApiError::BadRequest("record must be a JSON object".to_string()));
    };
    state.handle.submit(series, raw);
    Ok(StatusCode::ACCEPTED)
}

async fn active_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.active_alerts())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<String>,
}

async fn alert_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let since = match query.since.as_deref() {
        Some(raw) => parse_since(raw, now).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "invalid since '{raw}': expected RFC 3339 or a duration like 15m"
            ))
        })?,
        None => now - Duration::hours(1),
    };
    Ok(Json(state.pipeline.alert_history(since)))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    pub severity: Option<Severity>,
}

const DEFAULT_RECENT_LIMIT: usize = 10;

async fn recent_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    Json(
        state
            .pipeline
            .recent_alerts(query.limit.unwrap_or(DEFAULT_RECENT_LIMIT), query.severity),
    )
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("invalid alert id '{id}': {e}")))?;
    let alert = state
        .pipeline
        .acknowledge(id, Utc::now())
        .ok_or_else(|| ApiError::NotFound(format!("no active alert '{id}'")))?;
    info!(alert_id = %id, kind = %alert.kind, "Alert acknowledged");
    Ok(Json(alert))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub severity: Option<Severity>,
}

async fn clear_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearQuery>,
) -> impl IntoResponse {
    Json(state.pipeline.clear_alerts(query.severity))
}

async fn alert_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.pipeline.subscribe()).filter_map(|event| match event {
        Ok(event) => Event::default()
            .event(event.transition.as_str())
            .json_data(&event)
            .ok()
            .map(Ok),
        Err(e) => {
            // Slow subscribers skip what they missed
            warn!(error = %e, "Alert stream subscriber lagged");
            None
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// An RFC 3339 timestamp, or a look-back like `90s`, `15m`, `1h`, `7d`
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let lookback = match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => None,
    }?;
    now.checked_sub_signed(lookback)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/series", get(list_series))
        .route("/api/v1/series/:series/features", get(series_features))
        .route("/api/v1/series/:series/records", post(submit_record))
        .route("/api/v1/alerts", delete(clear_alerts))
        .route("/api/v1/alerts/active", get(active_alerts))
        .route("/api/v1/alerts/history", get(alert_history))
        .route("/api/v1/alerts/recent", get(recent_alerts))
        .route("/api/v1/alerts/:id/ack", post(acknowledge_alert))
        .route("/api/v1/alerts/stream", get(alert_stream))
        .with_state(state)
}

/// Serve the API until shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_since_durations() {
        assert_eq!(parse_since("15m", now()), Some(now() - Duration::minutes(15)));
        assert_eq!(parse_since("2h", now()), Some(now() - Duration::hours(2)));
        assert_eq!(parse_since("90s", now()), Some(now() - Duration::seconds(90)));
        assert_eq!(parse_since("7d", now()), Some(now() - Duration::days(7)));
    }

    #[test]
    fn test_parse_since_timestamp() {
        assert_eq!(
            parse_since("2024-05-01T10:00:00Z", now()),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_since_rejects_garbage() {
        assert_eq!(parse_since("yesterday", now()), None);
        assert_eq!(parse_since("15", now()), None);
        assert_eq!(parse_since("10w", now()), None);
    }

    #[test]
    fn test_parse_since_out_of_range() {
        assert_eq!(parse_since("99999999999d", now()), None);
        assert_eq!(parse_since("9223372036854775807s", now()), None);
        assert_eq!(parse_since("99999999999999999999h", now()), None);
    }
}
