use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::CommandProbeConfig;
use crate::template;
use crate::types::{Host, HostMetric};

use super::{Probe, ProbeError};

/// External command probe. Runs the command through `sh -c` and parses
/// metric-plugin output lines (`name<TAB>value<TAB>unix-seconds`) from
/// stdout. Unparseable lines are logged and skipped.
pub struct CommandProbe {
    host_id: String,
    command: String,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandProbeConfig {
    pub fn build(&self, host: &Host, context: &Value) -> anyhow::Result<CommandProbe> {
        let mut env = Vec::with_capacity(self.env.len());
        for (name, value) in &self.env {
            env.push((name.clone(), template::render(value, context)?));
        }
        Ok(CommandProbe {
            host_id: host.id.clone(),
            command: template::render(&self.command, context)?,
            env,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

impl fmt::Display for CommandProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {}", self.command)
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<HostMetric>, ProbeError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::cancelled(Vec::new())),
            output = tokio::time::timeout(self.timeout, command.output()) => match output {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(ProbeError::new(e)),
                Err(_) => {
                    return Err(ProbeError::new(anyhow!(
                        "command timed out after {:?}",
                        self.timeout
                    )));
                }
            },
        };

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.trim().is_empty() {
                warn!(line = %line, "command stderr");
            }
        }

        let metrics = parse_metric_lines(&self.host_id, &String::from_utf8_lossy(&output.stdout));

        if !output.status.success() {
            return Err(ProbeError::with_partial(
                metrics,
                anyhow!("command exited with {}", output.status),
            ));
        }
        Ok(metrics)
    }
}

fn parse_metric_lines(host_id: &str, stdout: &str) -> Vec<HostMetric> {
    let mut metrics = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(name), Some(value), Some(time)) = (fields.next(), fields.next(), fields.next())
        else {
            warn!(line = %line, "ignoring malformed metric line");
            continue;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            warn!(line = %line, "ignoring metric line with non-numeric value");
            continue;
        };
        let Ok(epoch) = time.trim().parse::<i64>() else {
            warn!(line = %line, "ignoring metric line with invalid timestamp");
            continue;
        };
        let timestamp = DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now);
        metrics.push(HostMetric {
            host_id: host_id.to_string(),
            name: name.to_string(),
            value,
            timestamp,
        });
    }
    metrics
}
