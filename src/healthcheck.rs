//! Readiness probing of the upstream's target port
//!
//! The supervisor's "started" notification only means the OS created the
//! process. A front end routing traffic needs to know that the server is
//! actually accepting connections, which is what this probe answers.

use crate::config::ReadinessConfig;
use crate::error::{Result, SupervisorError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-attempt connect and read timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes a local port until the upstream answers
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    port: u16,
    health_path: Option<String>,
    interval: Duration,
    timeout: Duration,
}

impl ReadinessProbe {
    /// Probe `port` with a plain TCP connect
    pub fn tcp(port: u16) -> Self {
        Self::from_config(port, &ReadinessConfig::default())
    }

    pub fn from_config(port: u16, config: &ReadinessConfig) -> Self {
        Self {
            port,
            health_path: config.health_path.clone(),
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }

    /// Require an HTTP 2xx from `path` instead of a bare connect (builder pattern)
    pub fn with_health_path(mut self, path: &str) -> Self {
        self.health_path = Some(path.to_string());
        self
    }

    /// Set the probe interval and overall timeout (builder pattern)
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Run a single probe
    pub async fn check(&self) -> bool {
        let connect_result = tokio::time::timeout(
            PROBE_TIMEOUT,
            TcpStream::connect(("127.0.0.1", self.port)),
        )
        .await;

        let stream = match connect_result {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => return false,
        };

        match &self.health_path {
            Some(path) => self.check_http(stream, path).await,
            None => true,
        }
    }

    async fn check_http(&self, mut stream: TcpStream, path: &str) -> bool {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            path, self.port
        );

        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }

        let read_result = tokio::time::timeout(PROBE_TIMEOUT, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            // "HTTP/1.1 200 OK\r\n"
            Ok(Ok(status_line)) => status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok())
                .map(|code| (200..300).contains(&code))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Probe until the upstream answers or the timeout elapses
    pub async fn wait_until_ready(&self) -> Result<()> {
        let start = Instant::now();
        debug!(port = self.port, health_path = ?self.health_path, "Waiting for upstream readiness");

        loop {
            if self.check().await {
                info!(
                    port = self.port,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Upstream is ready"
                );
                return Ok(());
            }

            if start.elapsed() >= self.timeout {
                return Err(SupervisorError::ReadinessTimeout {
                    port: self.port,
                    timeout: self.timeout,
                });
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
