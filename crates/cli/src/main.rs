//! Streamwatch CLI
//!
//! A command-line tool for inspecting alerts, series features and agent
//! status through the agent's read API.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::alerts::SeverityFilter;
use commands::{alerts, export, features, status};

/// Streamwatch CLI
#[derive(Parser)]
#[command(name = "swctl")]
#[command(author, version, about = "CLI for the Streamwatch anomaly detection agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via SWCTL_API_URL env var)
    #[arg(long, env = "SWCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect alerts
    #[command(subcommand)]
    Alerts(AlertsCommands),

    /// List tracked series
    Series,

    /// Show the latest feature vector of a series
    Features {
        /// Series key
        series: String,
    },

    /// Show agent status and component health
    Status,

    /// Export alert history
    Export {
        /// Look-back (e.g. 15m, 1h, 7d) or an RFC 3339 timestamp
        #[arg(long, default_value = "1h")]
        since: String,

        /// Minimum severity to include
        #[arg(long, value_enum)]
        severity: Option<SeverityFilter>,

        /// Output file path (stdout if not specified)
        #[arg(long, short)]
        output: Option<String>,

        /// Write CSV instead of JSON
        #[arg(long)]
        csv: bool,
    },
}

#[derive(Subcommand)]
pub enum AlertsCommands {
    /// Show active alerts
    Active {
        /// Minimum severity to show
        #[arg(long, value_enum)]
        severity: Option<SeverityFilter>,
    },

    /// Show alert transitions
    History {
        /// Look-back (e.g. 15m, 1h, 7d) or an RFC 3339 timestamp
        #[arg(long, default_value = "1h")]
        since: String,

        /// Minimum severity to show
        #[arg(long, value_enum)]
        severity: Option<SeverityFilter>,
    },

    /// Show the newest alert events
    Recent {
        /// Number of events to show
        #[arg(long, short, default_value_t = 10)]
        limit: usize,

        /// Only events of this severity
        #[arg(long, value_enum)]
        severity: Option<SeverityFilter>,
    },

    /// Acknowledge an active alert
    Ack {
        /// Alert id
        id: String,
    },

    /// Clear active alerts and history
    Clear {
        /// Only alerts of this severity (all if not specified)
        #[arg(long, value_enum)]
        severity: Option<SeverityFilter>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Alerts(alerts_cmd) => match alerts_cmd {
            AlertsCommands::Active { severity } => {
                alerts::show_active(&client, severity, cli.format).await?;
            }
            AlertsCommands::History { since, severity } => {
                alerts::show_history(&client, &since, severity, cli.format).await?;
            }
            AlertsCommands::Recent { limit, severity } => {
                alerts::show_recent(&client, limit, severity, cli.format).await?;
            }
            AlertsCommands::Ack { id } => {
                alerts::acknowledge(&client, &id, cli.format).await?;
            }
            AlertsCommands::Clear { severity } => {
                alerts::clear(&client, severity, cli.format).await?;
            }
        },
        Commands::Series => {
            features::list_series(&client, cli.format).await?;
        }
        Commands::Features { series } => {
            features::show_features(&client, &series, cli.format).await?;
        }
        Commands::Status => {
            status::show_status(&client, cli.format).await?;
        }
        Commands::Export {
            since,
            severity,
            output,
            csv,
        } => {
            export::export_alerts(&client, &since, severity, output, csv).await?;
        }
    }

    Ok(())
}
