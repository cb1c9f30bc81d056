use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::HttpProbeConfig;
use crate::template;
use crate::types::{Host, HostMetric};

use super::{Probe, ProbeError};

/// HTTP request-match probe. `check.ok` is 1 when the response status is
/// 2xx and the body matches the expected pattern (when configured);
/// status, response time and body length are reported either way.
pub struct HttpProbe {
    host_id: String,
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
    body: String,
    expect: Option<Regex>,
    no_check_certificate: bool,
    timeout: Duration,
    metric_prefix: String,
}

impl HttpProbeConfig {
    pub fn build(&self, host: &Host, context: &Value) -> Result<HttpProbe> {
        let method: reqwest::Method = self
            .method
            .to_uppercase()
            .parse()
            .with_context(|| format!("invalid HTTP method {}", self.method))?;
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers.push((name.clone(), template::render(value, context)?));
        }
        let expect = self
            .expect_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid expect_pattern")?;
        Ok(HttpProbe {
            host_id: host.id.clone(),
            url: template::render(&self.url, context)?,
            method,
            headers,
            body: self.body.clone(),
            expect,
            no_check_certificate: self.no_check_certificate,
            timeout: Duration::from_secs(self.timeout_secs),
            metric_prefix: self.metric_prefix.clone(),
        })
    }
}

impl fmt::Display for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http {} {}", self.method, self.url)
    }
}

impl HttpProbe {
    fn metric(&self, suffix: &str, value: f64) -> HostMetric {
        HostMetric {
            host_id: self.host_id.clone(),
            name: format!("{}.{}", self.metric_prefix, suffix),
            value,
            timestamp: Utc::now(),
        }
    }

    async fn request(&self) -> Result<(u16, String)> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.no_check_certificate)
            .build()
            .context("failed to build HTTP client")?;

        let mut request = client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if !self.body.is_empty() {
            request = request.body(self.body.clone());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("failed to read response body")?;
        Ok((status, body))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<HostMetric>, ProbeError> {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProbeError::cancelled(vec![self.metric("check.ok", 0.0)]));
            }
            outcome = self.request() => outcome,
        };
        let elapsed = start.elapsed().as_secs_f64();

        let (status, body) = match outcome {
            Ok(r) => r,
            Err(e) => {
                return Err(ProbeError::with_partial(
                    vec![self.metric("check.ok", 0.0)],
                    e,
                ));
            }
        };

        let status_ok = (200..300).contains(&status);
        let pattern_ok = self
            .expect
            .as_ref()
            .map(|re| re.is_match(&body))
            .unwrap_or(true);
        let ok = status_ok && pattern_ok;

        Ok(vec![
            self.metric("check.ok", if ok { 1.0 } else { 0.0 }),
            self.metric("response_time.seconds", elapsed),
            self.metric("status.code", status as f64),
            self.metric("content.length", body.len() as f64),
        ])
    }
}
