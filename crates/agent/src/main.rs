//! Streamwatch agent
//!
//! Runs one stream source into the detection pipeline and serves the read
//! API, health probes and Prometheus metrics.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use streamwatch_agent::{api, config::AgentConfig, config::LogFormat};
use streamwatch_core::{
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    Pipeline, PipelineRuntime,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "streamwatch-agent", version, about = "Streaming anomaly detection agent")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "STREAMWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref())?;
    init_tracing(config.log_format);

    info!(instance = %config.instance, source = config.stream.mode(), "Agent configured");

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let logger = StructuredLogger::new(&config.instance);
    let pipeline = Arc::new(
        Pipeline::new(config.pipeline.clone(), logger.clone())
            .context("failed to build pipeline")?,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = PipelineRuntime::spawn(pipeline.clone(), health_registry.clone(), &shutdown_tx);

    let source = config.stream.build();
    logger.log_startup(AGENT_VERSION, source.name());
    let source_task = tokio::spawn(source.run(
        runtime.handle(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(
        pipeline.clone(),
        runtime.handle(),
        health_registry.clone(),
    ));
    let api_task = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    match source_task.await {
        Ok(Err(e)) => error!(error = %e, "Stream source failed"),
        Err(e) => error!(error = %e, "Stream source task panicked"),
        Ok(Ok(())) => {}
    }
    runtime.join().await;

    // Open alert streams keep connections alive; don't wait on them forever
    match tokio::time::timeout(Duration::from_secs(5), api_task).await {
        Ok(Ok(Err(e))) => error!(error = %e, "API server failed"),
        Ok(_) => {}
        Err(_) => warn!("API server did not stop in time"),
    }

    info!("Shutdown complete");
    Ok(())
}
