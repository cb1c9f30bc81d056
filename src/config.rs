use std::collections::HashMap;
use std::env;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reducer::Reducer;

/// Top-level configuration.
///
/// Reloaded every tick; the orchestrator swaps it in only when the new
/// content is structurally different from the running one, so everything
/// here derives `PartialEq` over its declarative fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    location: String,

    /// Falls back to the MACKEREL_APIKEY environment variable.
    /// Kept out of the debug dump.
    #[serde(default, skip_serializing)]
    pub apikey: String,

    #[serde(default)]
    pub probes: Vec<ProbeDefinition>,
    #[serde(default = "default_true")]
    pub post_probed_metrics: bool,

    #[serde(default)]
    pub aggregates: Vec<AggregateDefinition>,
    #[serde(default = "default_true")]
    pub post_aggregated_metrics: bool,

    /// Deprecated. Inverse of `post_probed_metrics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_only: Option<bool>,
}

/// Selects hosts by service/roles/statuses and attaches any subset of the
/// probe variants. Every populated variant contributes independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    #[serde(default)]
    pub service: String,
    /// Legacy single-role form; merged into `roles` at load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandProbeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingProbeConfig {
    /// Hostname or IP address; supports `{{ ... }}` host templates.
    pub address: String,
    #[serde(default = "default_ping_count")]
    pub count: usize,
    /// Per-echo timeout.
    #[serde(default = "default_ping_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_ping_prefix")]
    pub metric_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpProbeConfig {
    /// Hostname or IP address; supports `{{ ... }}` host templates.
    pub host: String,
    /// Kept as a string so it can be templated.
    pub port: String,
    /// Payload written after connect, before reading the banner.
    #[serde(default)]
    pub send: String,
    /// Regex the read banner must match for the check to pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_pattern: Option<String>,
    /// Read cap while waiting for `expect_pattern`.
    #[serde(default = "default_tcp_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_tcp_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_tcp_prefix")]
    pub metric_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProbeConfig {
    /// Supports `{{ ... }}` host templates.
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    /// Header values support `{{ ... }}` host templates.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    /// Regex the response body must match for the check to pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_pattern: Option<String>,
    #[serde(default)]
    pub no_check_certificate: bool,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_http_prefix")]
    pub metric_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandProbeConfig {
    /// Run via `sh -c`; supports `{{ ... }}` host templates. Must print
    /// metric lines as `name<TAB>value<TAB>unix-seconds`.
    pub command: String,
    /// Extra environment; values support `{{ ... }}` host templates.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

/// Selects hosts and describes reductions over their latest metric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateDefinition {
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Source host metric name.
    pub name: String,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// One of sum|min|max|avg|average|count, case-insensitive.
    pub func: String,
    /// Destination service metric name.
    pub name: String,
    /// Bound during validation; unknown funcs stay unbound and are skipped
    /// at runtime.
    #[serde(skip)]
    pub reducer: Option<Reducer>,
}

// The bound reducer is derived from `func`, not declarative; keeping it out
// of equality keeps the reload comparison from ever seeing a difference the
// configuration file doesn't have.
impl PartialEq for OutputConfig {
    fn eq(&self, other: &Self) -> bool {
        self.func == other.func && self.name == other.name
    }
}

impl Config {
    /// Load and validate configuration. The location is interpreted as an
    /// `http(s)://` URL, an `s3://bucket/key` object, or a local file path.
    pub async fn load(location: &str) -> Result<Self> {
        let body = fetch(location).await.context("load config failed")?;
        let mut config: Config = serde_yaml::from_slice(&body)
            .with_context(|| format!("cannot parse configuration at {}", location))?;
        config.location = location.to_string();
        if config.apikey.is_empty() {
            config.apikey = env::var("MACKEREL_APIKEY").unwrap_or_default();
        }
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Parse, normalize and validate an inline YAML document, bypassing the
    /// location fetch.
    #[cfg(test)]
    pub(crate) fn from_yaml_for_tests(yaml: &str) -> Self {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize();
        config.validate().unwrap();
        config
    }

    // role -> roles
    fn normalize(&mut self) {
        for pd in &mut self.probes {
            if let Some(role) = &pd.role {
                pd.roles.push(role.clone());
            }
        }
        for ad in &mut self.aggregates {
            if let Some(role) = &ad.role {
                ad.roles.push(role.clone());
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.apikey.is_empty() {
            bail!("no API key (set apikey in the configuration or MACKEREL_APIKEY)");
        }

        if let Some(probe_only) = self.probe_only {
            warn!("configuration probe_only is now deprecated. use post_probed_metrics");
            self.post_probed_metrics = !probe_only;
        }

        for ad in &mut self.aggregates {
            for mc in &mut ad.metrics {
                for oc in &mut mc.outputs {
                    match Reducer::from_name(&oc.func) {
                        Some(reducer) => oc.reducer = Some(reducer),
                        None => warn!(
                            func = %oc.func,
                            metric = %mc.name,
                            "func is not available for outputs"
                        ),
                    }
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dump = serde_json::to_string(self).unwrap_or_else(|_| "<unserializable>".into());
        write!(f, "{}", dump)
    }
}

async fn fetch(location: &str) -> Result<Vec<u8>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        fetch_http(location).await
    } else if let Some(rest) = location.strip_prefix("s3://") {
        let (bucket, key) = rest
            .split_once('/')
            .with_context(|| format!("invalid S3 location {}", location))?;
        fetch_s3(bucket, key).await
    } else {
        tokio::fs::read(location)
            .await
            .with_context(|| format!("cannot read {}", location))
    }
}

async fn fetch_http(url: &str) -> Result<Vec<u8>> {
    debug!(url, "fetching configuration over HTTP");
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to fetch {}", url))?;
    Ok(response.bytes().await?.to_vec())
}

async fn fetch_s3(bucket: &str, key: &str) -> Result<Vec<u8>> {
    debug!(bucket, key, "fetching configuration from S3");
    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = aws_sdk_s3::Client::new(&aws);
    let object = client
        .get_object()
        .bucket(bucket)
        .key(key.trim_start_matches('/'))
        .send()
        .await
        .with_context(|| format!("failed to fetch s3://{}/{}", bucket, key))?;
    let body = object
        .body
        .collect()
        .await
        .context("failed to read S3 object body")?;
    Ok(body.into_bytes().to_vec())
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_ping_count() -> usize {
    3
}
fn default_ping_timeout() -> u64 {
    2
}
fn default_ping_prefix() -> String {
    "ping".to_string()
}
fn default_tcp_max_bytes() -> usize {
    32 * 1024
}
fn default_tcp_timeout() -> u64 {
    5
}
fn default_tcp_prefix() -> String {
    "tcp".to_string()
}
fn default_http_method() -> String {
    "GET".to_string()
}
fn default_http_timeout() -> u64 {
    15
}
fn default_http_prefix() -> String {
    "http".to_string()
}
fn default_command_timeout() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        Config::from_yaml_for_tests(yaml)
    }

    #[test]
    fn legacy_role_is_merged_into_roles() {
        let config = parse(
            r#"
apikey: test-key
probes:
  - service: web
    role: app
    ping:
      address: "{{ host.ip_addresses.eth0 }}"
aggregates:
  - service: web
    role: db
    roles: [replica]
    metrics: []
"#,
        );
        assert_eq!(config.probes[0].roles, vec!["app"]);
        assert_eq!(config.aggregates[0].roles, vec!["replica", "db"]);
    }

    #[test]
    fn roles_untouched_when_no_legacy_role() {
        let config = parse(
            r#"
apikey: test-key
probes:
  - service: web
    roles: [app, batch]
    ping:
      address: 127.0.0.1
"#,
        );
        assert!(config.probes[0].role.is_none());
        assert_eq!(config.probes[0].roles, vec!["app", "batch"]);
    }

    #[test]
    fn posting_defaults_to_enabled() {
        let config = parse("apikey: test-key");
        assert!(config.post_probed_metrics);
        assert!(config.post_aggregated_metrics);
    }

    #[test]
    fn probe_only_translates_with_deprecation() {
        let config = parse(
            r#"
apikey: test-key
probe_only: true
"#,
        );
        assert!(!config.post_probed_metrics);
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let mut config: Config = serde_yaml::from_str("probes: []").unwrap();
        config.normalize();
        assert!(config.validate().is_err());
    }

    #[test]
    fn known_funcs_are_bound_and_unknown_left_unbound() {
        let config = parse(
            r#"
apikey: test-key
aggregates:
  - service: web
    roles: [app]
    metrics:
      - name: loadavg5
        outputs:
          - func: Average
            name: loadavg5.avg
          - func: median
            name: loadavg5.median
"#,
        );
        let outputs = &config.aggregates[0].metrics[0].outputs;
        assert_eq!(outputs[0].reducer, Some(crate::reducer::Reducer::Avg));
        assert_eq!(outputs[1].reducer, None);
    }

    #[test]
    fn identical_content_compares_equal_regardless_of_binding() {
        let yaml = r#"
apikey: test-key
aggregates:
  - service: web
    roles: [app]
    metrics:
      - name: loadavg5
        outputs:
          - func: sum
            name: loadavg5.sum
"#;
        let validated = parse(yaml);
        // Parsed but never validated: reducers unbound.
        let mut unvalidated: Config = serde_yaml::from_str(yaml).unwrap();
        unvalidated.normalize();
        assert_eq!(validated, unvalidated);
    }

    #[test]
    fn changed_output_name_compares_unequal() {
        let base = r#"
apikey: test-key
aggregates:
  - service: web
    roles: [app]
    metrics:
      - name: loadavg5
        outputs:
          - func: sum
            name: loadavg5.sum
"#;
        let changed = base.replace("loadavg5.sum", "loadavg5.total");
        assert_ne!(parse(base), parse(&changed));
    }

    #[test]
    fn probe_config_defaults() {
        let config = parse(
            r#"
apikey: test-key
probes:
  - service: web
    roles: [app]
    ping:
      address: 127.0.0.1
    tcp:
      host: 127.0.0.1
      port: "22"
    http:
      url: http://example.com/
    command:
      command: "echo ok"
"#,
        );
        let pd = &config.probes[0];
        let ping = pd.ping.as_ref().unwrap();
        assert_eq!(ping.count, 3);
        assert_eq!(ping.metric_prefix, "ping");
        let tcp = pd.tcp.as_ref().unwrap();
        assert_eq!(tcp.timeout_secs, 5);
        assert_eq!(tcp.metric_prefix, "tcp");
        let http = pd.http.as_ref().unwrap();
        assert_eq!(http.method, "GET");
        assert_eq!(http.timeout_secs, 15);
        let command = pd.command.as_ref().unwrap();
        assert_eq!(command.timeout_secs, 15);
    }

    #[tokio::test]
    async fn load_reads_local_files() {
        let path = std::env::temp_dir().join("hostprobe-config-test.yaml");
        std::fs::write(&path, "apikey: from-file\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.apikey, "from-file");
        assert_eq!(config.location(), path.to_str().unwrap());
        std::fs::remove_file(&path).ok();
    }
}
