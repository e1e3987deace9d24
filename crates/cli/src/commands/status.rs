//! Agent status command

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_optional_timestamp, print_json, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Show agent status, component health and alert totals
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;
    let health = client.health().await?;

    if let OutputFormat::Json = format {
        return print_json(&json!({ "status": status, "health": health }));
    }

    println!("{}", "Agent Status".bold());
    println!("{}", "=".repeat(50));
    println!("Instance:      {}", status.instance.cyan());
    println!("Version:       {}", status.version);
    println!("Status:        {}", color_status(&status.status));
    println!("Series:        {}", status.series);
    println!("Active alerts: {}", status.active_alerts);
    println!("Unacked:       {}", status.history.unacknowledged);
    println!();

    println!("{}", "Alert History".bold());
    println!("{}", "-".repeat(50));
    println!("Events:        {}", status.history.total);
    for (severity, count) in &status.history.by_severity {
        println!("  {:<12}{}", severity, count);
    }
    for (transition, count) in &status.history.by_transition {
        println!("  {:<12}{}", transition, count);
    }
    println!(
        "Span:          {} .. {}",
        format_optional_timestamp(status.history.oldest.as_ref()),
        format_optional_timestamp(status.history.newest.as_ref())
    );
    println!();

    let rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, c)| ComponentRow {
            component: name.clone(),
            status: color_status(&c.status),
            message: c.message.clone().unwrap_or_default(),
        })
        .collect();
    println!("{}", "Components".bold());
    println!("{}", tabled::Table::new(&rows).with(tabled::settings::Style::rounded()));

    if health.status != "healthy" {
        print_warning(&format!("Agent is {}", health.status));
    }
    Ok(())
}
