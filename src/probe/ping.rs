use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::random;
use serde_json::Value;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use tokio_util::sync::CancellationToken;

use crate::config::PingProbeConfig;
use crate::template;
use crate::types::{Host, HostMetric};

use super::{Probe, ProbeError};

/// ICMP echo probe. Sends `count` echoes sequentially and reports
/// success/failure counts plus round-trip statistics over the replies.
pub struct PingProbe {
    host_id: String,
    address: String,
    count: usize,
    timeout: Duration,
    metric_prefix: String,
}

impl PingProbeConfig {
    pub fn build(&self, host: &Host, context: &Value) -> Result<PingProbe> {
        Ok(PingProbe {
            host_id: host.id.clone(),
            address: template::render(&self.address, context)?,
            count: self.count.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
            metric_prefix: self.metric_prefix.clone(),
        })
    }
}

impl fmt::Display for PingProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ping address={} count={}", self.address, self.count)
    }
}

impl PingProbe {
    fn metric(&self, suffix: &str, value: f64) -> HostMetric {
        HostMetric {
            host_id: self.host_id.clone(),
            name: format!("{}.{}", self.metric_prefix, suffix),
            value,
            timestamp: Utc::now(),
        }
    }

    fn counts(&self, success: usize, failure: usize) -> Vec<HostMetric> {
        vec![
            self.metric("count.success", success as f64),
            self.metric("count.failure", failure as f64),
        ]
    }

    async fn resolve(&self) -> Result<IpAddr> {
        if let Ok(ip) = self.address.parse() {
            return Ok(ip);
        }
        let mut addresses = tokio::net::lookup_host((self.address.as_str(), 0))
            .await
            .with_context(|| format!("cannot resolve {}", self.address))?;
        addresses
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| anyhow!("no addresses for {}", self.address))
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<HostMetric>, ProbeError> {
        let address = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::cancelled(Vec::new())),
            resolved = self.resolve() => resolved.map_err(ProbeError::new)?,
        };

        let config = match address {
            IpAddr::V4(_) => PingConfig::default(),
            IpAddr::V6(_) => PingConfig::builder().kind(ICMP::V6).build(),
        };
        let client = PingClient::new(&config).map_err(ProbeError::new)?;
        let mut pinger = client.pinger(address, PingIdentifier(random())).await;
        pinger.timeout(self.timeout);

        let payload = [0u8; 56];
        let mut rtts: Vec<f64> = Vec::with_capacity(self.count);
        let mut failures = 0usize;
        for seq in 0..self.count {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProbeError::cancelled(self.counts(rtts.len(), failures)));
                }
                reply = pinger.ping(PingSequence(seq as u16), &payload) => match reply {
                    Ok((_, rtt)) => rtts.push(rtt.as_secs_f64()),
                    Err(_) => failures += 1,
                },
            }
        }

        let mut metrics = self.counts(rtts.len(), failures);
        if rtts.is_empty() {
            return Err(ProbeError::with_partial(
                metrics,
                anyhow!("no echo replies from {}", address),
            ));
        }

        let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        metrics.push(self.metric("rtt.min", min));
        metrics.push(self.metric("rtt.max", max));
        metrics.push(self.metric("rtt.avg", avg));
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::host_context;

    fn host() -> Host {
        Host {
            id: "h1".into(),
            name: "web01".into(),
            interfaces: vec![crate::types::Interface {
                name: "eth0".into(),
                ip_address: Some("192.0.2.10".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn builds_with_rendered_address() {
        let config = PingProbeConfig {
            address: "{{ host.ip_addresses.eth0 }}".into(),
            count: 0,
            timeout_secs: 1,
            metric_prefix: "ping".into(),
        };
        let host = host();
        let probe = config.build(&host, &host_context(&host)).unwrap();
        assert_eq!(probe.address, "192.0.2.10");
        // A zero count still sends one echo.
        assert_eq!(probe.count, 1);
        assert_eq!(probe.to_string(), "ping address=192.0.2.10 count=1");
    }

    #[tokio::test]
    async fn cancelled_before_io_returns_promptly() {
        let config = PingProbeConfig {
            address: "192.0.2.10".into(),
            count: 3,
            timeout_secs: 1,
            metric_prefix: "ping".into(),
        };
        let host = host();
        let probe = config.build(&host, &host_context(&host)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = probe.run(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
