use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::TcpProbeConfig;
use crate::template;
use crate::types::{Host, HostMetric};

use super::{Probe, ProbeError};

/// TCP hello-expect probe: connect, optionally send a payload, optionally
/// require the banner to match a pattern. Reports `check.ok` and the
/// elapsed time.
pub struct TcpProbe {
    host_id: String,
    host: String,
    port: u16,
    send: String,
    expect: Option<Regex>,
    max_bytes: usize,
    timeout: Duration,
    metric_prefix: String,
}

impl TcpProbeConfig {
    pub fn build(&self, host: &Host, context: &Value) -> Result<TcpProbe> {
        let port = template::render(&self.port, context)?;
        let port: u16 = port
            .trim()
            .parse()
            .with_context(|| format!("invalid port {}", port))?;
        let expect = self
            .expect_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid expect_pattern")?;
        Ok(TcpProbe {
            host_id: host.id.clone(),
            host: template::render(&self.host, context)?,
            port,
            send: template::render(&self.send, context)?,
            expect,
            max_bytes: self.max_bytes,
            timeout: Duration::from_secs(self.timeout_secs),
            metric_prefix: self.metric_prefix.clone(),
        })
    }
}

impl fmt::Display for TcpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp host={} port={}", self.host, self.port)
    }
}

impl TcpProbe {
    fn metric(&self, suffix: &str, value: f64) -> HostMetric {
        HostMetric {
            host_id: self.host_id.clone(),
            name: format!("{}.{}", self.metric_prefix, suffix),
            value,
            timestamp: Utc::now(),
        }
    }

    async fn check(&self) -> Result<()> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("cannot connect to {}:{}", self.host, self.port))?;

        if !self.send.is_empty() {
            stream
                .write_all(self.send.as_bytes())
                .await
                .context("write failed")?;
        }

        if let Some(expect) = &self.expect {
            let mut banner = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.context("read failed")?;
                if n == 0 {
                    break;
                }
                banner.extend_from_slice(&chunk[..n]);
                if expect.is_match(&String::from_utf8_lossy(&banner)) {
                    return Ok(());
                }
                if banner.len() >= self.max_bytes {
                    break;
                }
            }
            bail!("response did not match {}", expect.as_str());
        }

        Ok(())
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<HostMetric>, ProbeError> {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProbeError::cancelled(vec![self.metric("check.ok", 0.0)]));
            }
            outcome = tokio::time::timeout(self.timeout, self.check()) => outcome,
        };
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(())) => Ok(vec![
                self.metric("check.ok", 1.0),
                self.metric("elapsed.seconds", elapsed),
            ]),
            Ok(Err(e)) => Err(ProbeError::with_partial(
                vec![
                    self.metric("check.ok", 0.0),
                    self.metric("elapsed.seconds", elapsed),
                ],
                e,
            )),
            Err(_) => Err(ProbeError::with_partial(
                vec![self.metric("check.ok", 0.0)],
                anyhow::anyhow!("connection to {}:{} timed out", self.host, self.port),
            )),
        }
    }
}
