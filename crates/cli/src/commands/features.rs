//! Series and feature inspection commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, FeatureView, FieldStatsView};
use crate::output::{
    format_optional, format_optional_timestamp, format_sampled, format_timestamp, print_json,
    print_rows, OutputFormat,
};

#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Oldest")]
    oldest: String,
    #[tabled(rename = "Newest")]
    newest: String,
    #[tabled(rename = "Appended")]
    appended: u64,
    #[tabled(rename = "Evicted")]
    evicted: u64,
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Std")]
    std: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "P95")]
    p95: String,
    #[tabled(rename = "P99")]
    p99: String,
    #[tabled(rename = "EMA")]
    ema: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
    #[tabled(rename = "Recent")]
    recent: String,
    #[tabled(rename = "Spike")]
    spike: String,
}

impl FieldRow {
    fn new(field: &'static str, stats: &FieldStatsView) -> Self {
        Self {
            field,
            mean: format!("{:.2}", stats.mean),
            std: format!("{:.2}", stats.std),
            min: format!("{:.2}", stats.min),
            max: format!("{:.2}", stats.max),
            p95: format!("{:.2}", stats.p95),
            p99: format!("{:.2}", stats.p99),
            ema: format!("{:.2}", stats.ema),
            baseline: format_optional(stats.baseline_mean, 2),
            recent: format_optional(stats.recent_mean, 2),
            spike: format_optional(stats.spike_score, 2),
        }
    }
}

/// List tracked series with their window occupancy
pub async fn list_series(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let series = client.series().await?;
    let rows: Vec<SeriesRow> = series
        .iter()
        .map(|s| SeriesRow {
            series: s.series_key.clone(),
            size: format!("{}/{}", s.size, s.capacity),
            oldest: format_optional_timestamp(s.oldest.as_ref()),
            newest: format_optional_timestamp(s.newest.as_ref()),
            appended: s.total_appended,
            evicted: s.total_evicted,
        })
        .collect();
    print_rows(&rows, &series, format)
}

/// Show the latest feature vector of one series
pub async fn show_features(client: &ApiClient, series: &str, format: OutputFormat) -> Result<()> {
    let features = client.features(series).await?;
    match format {
        OutputFormat::Json => print_json(&features),
        OutputFormat::Table => {
            print_features(&features);
            Ok(())
        }
    }
}

fn field_rows(features: &FeatureView) -> Vec<FieldRow> {
    [
        ("response_time_ms", features.response_time.as_ref()),
        ("cpu_pct", features.cpu.as_ref()),
        ("mem_pct", features.mem.as_ref()),
    ]
    .into_iter()
    .filter_map(|(name, stats)| stats.map(|s| FieldRow::new(name, s)))
    .collect()
}

fn print_features(features: &FeatureView) {
    println!("{}", "Feature Vector".bold());
    println!("{}", "=".repeat(50));
    println!("Series:              {}", features.series_key.cyan());
    println!("Computed at:         {}", format_timestamp(&features.timestamp));
    println!(
        "Samples:             {} (baseline {}, recent {})",
        features.sample_count, features.baseline_count, features.recent_count
    );
    println!();

    println!("{}", "Traffic".bold());
    println!("{}", "-".repeat(50));
    println!("RPS recent:          {}", format_sampled(&features.rps_recent, 2));
    println!("RPS baseline:        {}", format_sampled(&features.rps_baseline, 2));
    println!(
        "Error rate recent:   {}",
        format_sampled(&features.error_rate_recent, 3)
    );
    println!(
        "Error rate baseline: {}",
        format_sampled(&features.error_rate_baseline, 3)
    );
    println!();

    let rows = field_rows(features);
    if !rows.is_empty() {
        println!("{}", "Fields".bold());
        println!("{}", tabled::Table::new(rows).with(tabled::settings::Style::rounded()));
    }
}
