//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use crate::client::SampledView;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or `raw` as JSON
pub fn print_rows<T: Tabled, R: Serialize + ?Sized>(
    rows: &[T],
    raw: &R,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found".yellow());
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
        OutputFormat::Json => print_json(raw)?,
    }
    Ok(())
}

pub fn print_json<R: Serialize + ?Sized>(raw: &R) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(raw)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_optional_timestamp(ts: Option<&DateTime<Utc>>) -> String {
    ts.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

/// A sampled feature value, or how many samples are still missing
pub fn format_sampled(value: &SampledView, precision: usize) -> String {
    match value {
        SampledView::Ready(v) => format!("{:.*}", precision, v),
        SampledView::Insufficient { have, need } => format!("n/a ({have}/{need})"),
    }
}

pub fn format_optional(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

/// Color severity based on value
pub fn color_severity(severity: &str) -> String {
    match severity.to_lowercase().as_str() {
        "critical" => severity.red().bold().to_string(),
        "warning" => severity.yellow().to_string(),
        "info" => severity.blue().to_string(),
        _ => severity.to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "active" | "raised" => status.green().to_string(),
        "degraded" | "renotified" | "escalated" => status.yellow().to_string(),
        "unhealthy" => status.red().to_string(),
        "acknowledged" => status.cyan().to_string(),
        "resolved" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}
