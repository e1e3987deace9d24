//! Alert history export

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::client::{AlertEventView, ApiClient};
use crate::commands::alerts::{filter_events, SeverityFilter};
use crate::output::print_success;

/// One flattened CSV line per alert event
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    emitted_at: String,
    transition: &'a str,
    alert_id: &'a str,
    series_key: &'a str,
    kind: &'a str,
    source_id: &'a str,
    severity: &'a str,
    score: f64,
    occurrence_count: u32,
    acknowledged: bool,
    first_seen: String,
    last_seen: String,
    detail: &'a str,
}

impl<'a> From<&'a AlertEventView> for CsvRow<'a> {
    fn from(event: &'a AlertEventView) -> Self {
        let alert = &event.alert;
        Self {
            emitted_at: event.emitted_at.to_rfc3339(),
            transition: &event.transition,
            alert_id: &alert.id,
            series_key: &alert.series_key,
            kind: &alert.kind,
            source_id: &alert.source_id,
            severity: &alert.severity,
            score: alert.score,
            occurrence_count: alert.occurrence_count,
            acknowledged: alert.acknowledged,
            first_seen: alert.first_seen.to_rfc3339(),
            last_seen: alert.last_seen.to_rfc3339(),
            detail: &alert.detail,
        }
    }
}

/// Export alert transitions as JSON (default) or CSV, to a file or stdout
pub async fn export_alerts(
    client: &ApiClient,
    since: &str,
    severity: Option<SeverityFilter>,
    output: Option<String>,
    csv: bool,
) -> Result<()> {
    let events = filter_events(client.alert_history(since).await?, severity);

    match &output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {path}"))?;
            let mut writer = BufWriter::new(file);
            write_events(&mut writer, &events, csv)?;
            writer.flush()?;
            print_success(&format!("Exported {} alert events to {}", events.len(), path));
        }
        None => {
            let stdout = io::stdout();
            let mut writer = stdout.lock();
            write_events(&mut writer, &events, csv)?;
        }
    }
    Ok(())
}

fn write_events<W: Write>(writer: &mut W, events: &[AlertEventView], as_csv: bool) -> Result<()> {
    if as_csv {
        let mut csv_writer = csv::Writer::from_writer(&mut *writer);
        for event in events {
            csv_writer
                .serialize(CsvRow::from(event))
                .context("Failed to write CSV row")?;
        }
        csv_writer.flush()?;
    } else {
        serde_json::to_writer_pretty(&mut *writer, events)?;
        writeln!(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::alert_json;
    use serde_json::json;

    fn events() -> Vec<AlertEventView> {
        let mut alert = alert_json("http_5xx", "critical");
        alert["detail"] = json!("HTTP 503, \"upstream\" timeout");
        serde_json::from_value(json!([{
            "transition": "raised",
            "emitted_at": "2024-05-01T12:00:05Z",
            "alert": alert,
        }]))
        .unwrap()
    }

    #[test]
    fn test_csv_output() {
        let mut buf = Vec::new();
        write_events(&mut buf, &events(), true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "emitted_at,transition,alert_id,series_key,kind,source_id,severity,score,\
             occurrence_count,acknowledged,first_seen,last_seen,detail"
        );
        assert!(lines[1].starts_with("2024-05-01T12:00:05+00:00,raised,"));
        assert!(lines[1].contains(",3,false,"));
        assert!(lines[1].ends_with(",\"HTTP 503, \"\"upstream\"\" timeout\""));
    }

    #[test]
    fn test_csv_output_reads_back() {
        let mut buf = Vec::new();
        write_events(&mut buf, &events(), true).unwrap();
        let mut reader = csv::Reader::from_reader(buf.as_slice());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][4], "http_5xx");
        assert_eq!(&records[0][12], "HTTP 503, \"upstream\" timeout");
    }

    #[test]
    fn test_json_output_parses_back() {
        let mut buf = Vec::new();
        write_events(&mut buf, &events(), false).unwrap();
        let parsed: Vec<AlertEventView> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].alert.kind, "http_5xx");
    }

    #[tokio::test]
    async fn test_export_to_file() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/alerts/history")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(serde_json::to_string(&events()).unwrap())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.csv");
        let client = ApiClient::new(&server.url()).unwrap();
        export_alerts(
            &client,
            "1h",
            Some(SeverityFilter::Warning),
            Some(path.to_string_lossy().into_owned()),
            true,
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains(",http_5xx,gateway,critical,"));
    }
}
