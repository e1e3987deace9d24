//! TCP socket source reading newline-delimited JSON

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::health::{components, HealthRegistry};
use crate::pipeline::PipelineHandle;

use super::{default_series, parse_record, series_for, wait_or_shutdown, Backoff, RecordSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_series")]
    pub series: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_max_reconnect_secs")]
    pub max_reconnect_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

pub(crate) fn default_reconnect_secs() -> u64 {
    1
}

pub(crate) fn default_max_reconnect_secs() -> u64 {
    30
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            series: default_series(),
            host: default_host(),
            port: default_port(),
            reconnect_secs: default_reconnect_secs(),
            max_reconnect_secs: default_max_reconnect_secs(),
        }
    }
}

pub struct SocketSource {
    config: SocketConfig,
}

/// How a connection ended
enum Ended {
    Shutdown,
    Disconnected,
}

impl SocketSource {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn read_lines(
        &self,
        stream: TcpStream,
        sink: &PipelineHandle,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Ended> {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("socket read failed")? else {
                        return Ok(Ended::Disconnected);
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_record(&line) {
                        Ok(raw) => {
                            let series = series_for(&raw, &self.config.series).to_string();
                            sink.submit(series, raw);
                        }
                        Err(e) => debug!(error = %e, "Skipping unparseable line"),
                    }
                }
                _ = shutdown.recv() => return Ok(Ended::Shutdown),
            }
        }
    }
}

#[async_trait]
impl RecordSource for SocketSource {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn run(
        self: Box<Self>,
        sink: PipelineHandle,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let address = self.address();
        let mut backoff = Backoff::new(self.config.reconnect_secs, self.config.max_reconnect_secs);
        info!(address = %address, "Starting socket source");

        loop {
            let connected = tokio::select! {
                result = TcpStream::connect(&address) => result,
                _ = shutdown.recv() => break,
            };
            match connected {
                Ok(stream) => {
                    info!(address = %address, "Socket connected");
                    backoff.reset();
                    health.set_healthy(components::INGEST).await;
                    match self.read_lines(stream, &sink, &mut shutdown).await {
                        Ok(Ended::Shutdown) => break,
                        Ok(Ended::Disconnected) => warn!(address = %address, "Socket closed by peer"),
                        Err(e) => warn!(address = %address, error = %e, "Socket connection lost"),
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Socket connect failed");
                }
            }

            let delay = backoff.next_delay();
            health
                .set_degraded(
                    components::INGEST,
                    format!("reconnecting to {address} in {}s", delay.as_secs()),
                )
                .await;
            if !wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!("Shutting down socket source");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reads_ndjson_and_routes_series() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(
                b"{\"status_code\": 200}\nnot json\n\n{\"series\": \"edge\", \"cpu_pct\": 50}\n",
            )
            .await
            .unwrap();
            conn.flush().await.unwrap();
            // Hold the connection until the test is done reading
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        });

        let (sink, mut rx) = PipelineHandle::detached();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let health = HealthRegistry::new();
        let source = Box::new(SocketSource::new(SocketConfig {
            port,
            ..SocketConfig::default()
        }));
        let task = tokio::spawn(source.run(sink, health.clone(), shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.series_key, "default");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.series_key, "edge");
        assert_eq!(
            health.health().await.components[components::INGEST].status,
            ComponentStatus::Healthy
        );

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_peer_degrades_and_stops_on_shutdown() {
        // Grab a free port, then close it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (sink, _rx) = PipelineHandle::detached();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let health = HealthRegistry::new();
        let source = Box::new(SocketSource::new(SocketConfig {
            port,
            reconnect_secs: 5,
            ..SocketConfig::default()
        }));
        let task = tokio::spawn(source.run(sink, health.clone(), shutdown_rx));

        let probe = health.clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async move {
            loop {
                let health = probe.health().await;
                if health
                    .components
                    .get(components::INGEST)
                    .is_some_and(|c| c.status == ComponentStatus::Degraded)
                {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
