//! Alert-related CLI commands

use anyhow::Result;
use clap::ValueEnum;
use tabled::Tabled;

use crate::client::{AlertEventView, AlertView, ApiClient};
use crate::output::{
    color_severity, color_status, format_timestamp, print_json, print_rows, print_success,
    OutputFormat,
};

/// Severity level; a minimum for listings, an exact level for clear and recent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum SeverityFilter {
    Info,
    Warning,
    Critical,
}

impl SeverityFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityFilter::Info => "info",
            SeverityFilter::Warning => "warning",
            SeverityFilter::Critical => "critical",
        }
    }

    fn admits(&self, severity: &str) -> bool {
        let rank = match severity {
            "critical" => SeverityFilter::Critical,
            "warning" => SeverityFilter::Warning,
            _ => SeverityFilter::Info,
        };
        rank >= *self
    }
}

#[derive(Tabled)]
struct ActiveAlertRow {
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Count")]
    count: u32,
    #[tabled(rename = "Ack")]
    ack: String,
    #[tabled(rename = "First Seen")]
    first_seen: String,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl From<&AlertView> for ActiveAlertRow {
    fn from(alert: &AlertView) -> Self {
        Self {
            series: alert.series_key.clone(),
            kind: alert.kind.clone(),
            source: alert.source_id.clone(),
            severity: color_severity(&alert.severity),
            score: format!("{:.2}", alert.score),
            count: alert.occurrence_count,
            ack: if alert.acknowledged { "yes" } else { "-" }.to_string(),
            first_seen: format_timestamp(&alert.first_seen),
            last_seen: format_timestamp(&alert.last_seen),
        }
    }
}

#[derive(Tabled)]
struct AlertEventRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Transition")]
    transition: String,
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&AlertEventView> for AlertEventRow {
    fn from(event: &AlertEventView) -> Self {
        Self {
            time: format_timestamp(&event.emitted_at),
            transition: color_status(&event.transition),
            series: event.alert.series_key.clone(),
            kind: event.alert.kind.clone(),
            source: event.alert.source_id.clone(),
            severity: color_severity(&event.alert.severity),
            detail: event.alert.detail.clone(),
        }
    }
}

/// Show currently active alerts, most severe first
pub async fn show_active(
    client: &ApiClient,
    severity: Option<SeverityFilter>,
    format: OutputFormat,
) -> Result<()> {
    let mut alerts = client.active_alerts().await?;
    if let Some(filter) = severity {
        alerts.retain(|a| filter.admits(&a.severity));
    }

    if alerts.is_empty() && matches!(format, OutputFormat::Table) {
        print_success("No active alerts");
        return Ok(());
    }

    let rows: Vec<ActiveAlertRow> = alerts.iter().map(ActiveAlertRow::from).collect();
    print_rows(&rows, &alerts, format)
}

/// Show alert transitions since a point in time
pub async fn show_history(
    client: &ApiClient,
    since: &str,
    severity: Option<SeverityFilter>,
    format: OutputFormat,
) -> Result<()> {
    let events = filter_events(client.alert_history(since).await?, severity);
    let rows: Vec<AlertEventRow> = events.iter().map(AlertEventRow::from).collect();
    print_rows(&rows, &events, format)
}

/// Show the newest alert events, optionally of one severity only
pub async fn show_recent(
    client: &ApiClient,
    limit: usize,
    severity: Option<SeverityFilter>,
    format: OutputFormat,
) -> Result<()> {
    let events = client
        .recent_alerts(limit, severity.map(|s| s.as_str()))
        .await?;
    let rows: Vec<AlertEventRow> = events.iter().map(AlertEventRow::from).collect();
    print_rows(&rows, &events, format)
}

/// Acknowledge an active alert by id
pub async fn acknowledge(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let alert = client.acknowledge(id).await?;
    match format {
        OutputFormat::Json => print_json(&alert),
        OutputFormat::Table => {
            print_success(&format!(
                "Acknowledged {} alert {} on {}",
                alert.kind, alert.id, alert.series_key
            ));
            Ok(())
        }
    }
}

/// Clear active alerts and history of one severity, or everything
pub async fn clear(
    client: &ApiClient,
    severity: Option<SeverityFilter>,
    format: OutputFormat,
) -> Result<()> {
    let cleared = client.clear_alerts(severity.map(|s| s.as_str())).await?;
    match format {
        OutputFormat::Json => print_json(&cleared),
        OutputFormat::Table => {
            print_success(&format!(
                "Cleared {} active alerts and {} history events ({})",
                cleared.active,
                cleared.history,
                severity.map(|s| s.as_str()).unwrap_or("all severities")
            ));
            Ok(())
        }
    }
}

pub(crate) fn filter_events(
    mut events: Vec<AlertEventView>,
    severity: Option<SeverityFilter>,
) -> Vec<AlertEventView> {
    if let Some(filter) = severity {
        events.retain(|e| filter.admits(&e.alert.severity));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::alert_json;
    use serde_json::json;

    fn event(severity: &str) -> AlertEventView {
        serde_json::from_value(json!({
            "transition": "raised",
            "emitted_at": "2024-05-01T12:00:00Z",
            "alert": alert_json("latency_spike", severity),
        }))
        .unwrap()
    }

    #[test]
    fn test_severity_filter_is_a_minimum() {
        assert!(SeverityFilter::Warning.admits("critical"));
        assert!(SeverityFilter::Warning.admits("warning"));
        assert!(!SeverityFilter::Warning.admits("info"));
        assert!(SeverityFilter::Info.admits("info"));
    }

    #[test]
    fn test_ack_column() {
        let mut alert: AlertView =
            serde_json::from_value(alert_json("http_5xx", "critical")).unwrap();
        assert_eq!(ActiveAlertRow::from(&alert).ack, "-");
        alert.acknowledged = true;
        assert_eq!(ActiveAlertRow::from(&alert).ack, "yes");
    }

    #[test]
    fn test_filter_events() {
        let events = vec![event("info"), event("critical"), event("warning")];
        let kept = filter_events(events.clone(), Some(SeverityFilter::Critical));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].alert.severity, "critical");

        assert_eq!(filter_events(events, None).len(), 3);
    }
}
