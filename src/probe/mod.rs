pub mod command;
pub mod http;
pub mod ping;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{
    CommandProbeConfig, HttpProbeConfig, PingProbeConfig, ProbeDefinition, TcpProbeConfig,
};
use crate::types::{Host, HostMetric};

/// A single active check against one host.
///
/// Implementations honor cancellation: when the token fires before or
/// during I/O they return promptly with whatever metrics they already
/// produced riding along on the error. They report their own timeouts as
/// errors and never panic.
#[async_trait]
pub trait Probe: fmt::Display + Send + Sync {
    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<HostMetric>, ProbeError>;
}

/// Probe failure carrying any metrics produced before the failure. The
/// runner logs the error and still forwards the partial output.
#[derive(Debug)]
pub struct ProbeError {
    pub partial: Vec<HostMetric>,
    pub source: anyhow::Error,
}

impl ProbeError {
    pub fn new(source: impl Into<anyhow::Error>) -> Self {
        Self {
            partial: Vec::new(),
            source: source.into(),
        }
    }

    pub fn with_partial(partial: Vec<HostMetric>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            partial,
            source: source.into(),
        }
    }

    pub fn cancelled(partial: Vec<HostMetric>) -> Self {
        Self::with_partial(partial, anyhow::anyhow!("probe cancelled"))
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The probe variants a definition can attach. Every populated variant
/// contributes independently.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeConfig {
    Ping(PingProbeConfig),
    Tcp(TcpProbeConfig),
    Http(HttpProbeConfig),
    Command(CommandProbeConfig),
}

impl ProbeConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeConfig::Ping(_) => "ping",
            ProbeConfig::Tcp(_) => "tcp",
            ProbeConfig::Http(_) => "http",
            ProbeConfig::Command(_) => "command",
        }
    }

    /// Render the config against the host and produce a runnable probe.
    pub fn build(&self, host: &Host) -> anyhow::Result<Box<dyn Probe>> {
        let context = crate::template::host_context(host);
        match self {
            ProbeConfig::Ping(c) => Ok(Box::new(c.build(host, &context)?)),
            ProbeConfig::Tcp(c) => Ok(Box::new(c.build(host, &context)?)),
            ProbeConfig::Http(c) => Ok(Box::new(c.build(host, &context)?)),
            ProbeConfig::Command(c) => Ok(Box::new(c.build(host, &context)?)),
        }
    }
}

impl ProbeDefinition {
    /// All populated probe variants, in declaration order.
    pub fn probe_configs(&self) -> Vec<ProbeConfig> {
        let mut configs = Vec::new();
        if let Some(c) = &self.ping {
            configs.push(ProbeConfig::Ping(c.clone()));
        }
        if let Some(c) = &self.tcp {
            configs.push(ProbeConfig::Tcp(c.clone()));
        }
        if let Some(c) = &self.http {
            configs.push(ProbeConfig::Http(c.clone()));
        }
        if let Some(c) = &self.command {
            configs.push(ProbeConfig::Command(c.clone()));
        }
        configs
    }
}

/// Instantiate every populated probe variant for one host. A variant whose
/// templates fail to render for this host is logged and skipped; the rest
/// still run.
pub fn generate_probes(definition: &ProbeDefinition, host: &Host) -> Vec<Box<dyn Probe>> {
    let mut probes = Vec::new();
    for config in definition.probe_configs() {
        match config.build(host) {
            Ok(probe) => probes.push(probe),
            Err(e) => error!(
                host_id = %host.id,
                host = %host.name,
                probe = config.kind(),
                error = %e,
                "cannot generate probe"
            ),
        }
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interface;

    fn host() -> Host {
        Host {
            id: "h1".into(),
            name: "web01".into(),
            interfaces: vec![Interface {
                name: "eth0".into(),
                ip_address: Some("10.0.0.5".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn definition() -> ProbeDefinition {
        ProbeDefinition {
            service: "web".into(),
            ping: Some(PingProbeConfig {
                address: "{{ host.ip_addresses.eth0 }}".into(),
                count: 1,
                timeout_secs: 1,
                metric_prefix: "ping".into(),
            }),
            command: Some(CommandProbeConfig {
                command: "echo ok".into(),
                env: Default::default(),
                timeout_secs: 5,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn all_populated_variants_contribute() {
        let configs = definition().probe_configs();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].kind(), "ping");
        assert_eq!(configs[1].kind(), "command");
    }

    #[test]
    fn generates_probes_for_host() {
        let probes = generate_probes(&definition(), &host());
        assert_eq!(probes.len(), 2);
        assert!(probes[0].to_string().contains("10.0.0.5"));
    }

    #[test]
    fn unrenderable_variant_is_skipped() {
        let mut def = definition();
        def.ping.as_mut().unwrap().address = "{{ host.ip_addresses.bond0 }}".into();
        let probes = generate_probes(&def, &host());
        // ping fails to render, command survives
        assert_eq!(probes.len(), 1);
    }
}
