use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::types::{Host, HostMetric, LatestValues, ServiceMetric};

const DEFAULT_BASE_URL: &str = "https://api.mackerelio.com";

/// Host selection for discovery. Empty fields are omitted from the query.
#[derive(Debug, Clone, Default)]
pub struct HostQuery {
    pub service: String,
    pub roles: Vec<String>,
    pub statuses: Vec<String>,
}

/// The upstream monitoring service: host discovery, latest metric values,
/// and the two posting endpoints. Kept behind a trait so the runners and
/// shippers can be exercised against an in-memory double.
#[async_trait]
pub trait MonitoringBackend: Send + Sync {
    async fn find_hosts(&self, query: &HostQuery) -> Result<Vec<Host>>;

    async fn fetch_latest_metric_values(
        &self,
        host_ids: &[String],
        metric_names: &[String],
    ) -> Result<LatestValues>;

    async fn post_host_metric_values(&self, metrics: &[HostMetric]) -> Result<()>;

    async fn post_service_metric_values(
        &self,
        service: &str,
        metrics: &[ServiceMetric],
    ) -> Result<()>;
}

/// Host metric in the upstream wire format
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetricValue {
    pub host_id: String,
    pub name: String,
    pub time: i64,
    pub value: f64,
}

impl From<&HostMetric> for HostMetricValue {
    fn from(m: &HostMetric) -> Self {
        Self {
            host_id: m.host_id.clone(),
            name: m.name.clone(),
            time: m.timestamp.timestamp(),
            value: m.value,
        }
    }
}

/// Service metric in the upstream wire format
#[derive(Debug, Clone, Serialize)]
pub struct MetricValue {
    pub name: String,
    pub time: i64,
    pub value: f64,
}

impl From<&ServiceMetric> for MetricValue {
    fn from(m: &ServiceMetric) -> Self {
        Self {
            name: m.name.clone(),
            time: m.timestamp.timestamp(),
            value: m.value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindHostsResponse {
    hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(rename = "tsdbLatest")]
    tsdb_latest: LatestValues,
}

/// Mackerel v0 REST client.
///
/// Every call holds one permit of the shared client semaphore so that a
/// burst of runners cannot pile arbitrary concurrent calls onto the API.
pub struct MackerelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    semaphore: Arc<Semaphore>,
}

impl MackerelClient {
    pub fn new(api_key: &str, semaphore: Arc<Semaphore>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL, semaphore)
    }

    pub fn with_base_url(
        api_key: &str,
        base_url: &str,
        semaphore: Arc<Semaphore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            semaphore,
        })
    }

    async fn throttle(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .context("client semaphore closed")
    }
}

#[async_trait]
impl MonitoringBackend for MackerelClient {
    async fn find_hosts(&self, query: &HostQuery) -> Result<Vec<Host>> {
        let _permit = self.throttle().await?;

        let mut params: Vec<(&str, &str)> = Vec::new();
        if !query.service.is_empty() {
            params.push(("service", &query.service));
        }
        for role in &query.roles {
            params.push(("role", role));
        }
        for status in &query.statuses {
            params.push(("status", status));
        }

        let response: FindHostsResponse = self
            .client
            .get(format!("{}/api/v0/hosts", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .query(&params)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("find hosts request failed")?
            .json()
            .await
            .context("cannot parse find hosts response")?;

        Ok(response.hosts)
    }

    async fn fetch_latest_metric_values(
        &self,
        host_ids: &[String],
        metric_names: &[String],
    ) -> Result<LatestValues> {
        let _permit = self.throttle().await?;

        let mut params: Vec<(&str, &str)> = Vec::new();
        for id in host_ids {
            params.push(("hostId", id));
        }
        for name in metric_names {
            params.push(("name", name));
        }

        let response: LatestResponse = self
            .client
            .get(format!("{}/api/v0/tsdb/latest", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .query(&params)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("latest metric values request failed")?
            .json()
            .await
            .context("cannot parse latest metric values response")?;

        Ok(response.tsdb_latest)
    }

    async fn post_host_metric_values(&self, metrics: &[HostMetric]) -> Result<()> {
        let _permit = self.throttle().await?;

        let payload: Vec<HostMetricValue> = metrics.iter().map(HostMetricValue::from).collect();
        debug!(count = payload.len(), "posting host metric values");
        self.client
            .post(format!("{}/api/v0/tsdb", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("post host metric values failed")?;
        Ok(())
    }

    async fn post_service_metric_values(
        &self,
        service: &str,
        metrics: &[ServiceMetric],
    ) -> Result<()> {
        let _permit = self.throttle().await?;

        let payload: Vec<MetricValue> = metrics.iter().map(MetricValue::from).collect();
        debug!(service, count = payload.len(), "posting service metric values");
        self.client
            .post(format!("{}/api/v0/services/{}/tsdb", self.base_url, service))
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("post service metric values failed")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// In-memory backend double. Posts are recorded per batch; the first
    /// `fail_*` calls of each posting endpoint return errors so retry
    /// behavior can be observed.
    #[derive(Default)]
    pub struct MockBackend {
        pub hosts: Vec<Host>,
        pub latest: LatestValues,
        pub fail_find_hosts: bool,
        pub fail_host_posts: Mutex<usize>,
        pub fail_service_posts: Mutex<usize>,
        pub posted_host_batches: Mutex<Vec<Vec<HostMetric>>>,
        pub posted_service_batches: Mutex<Vec<(String, Vec<ServiceMetric>)>>,
    }

    #[async_trait]
    impl MonitoringBackend for MockBackend {
        async fn find_hosts(&self, _query: &HostQuery) -> Result<Vec<Host>> {
            if self.fail_find_hosts {
                anyhow::bail!("discovery unavailable");
            }
            Ok(self.hosts.clone())
        }

        async fn fetch_latest_metric_values(
            &self,
            _host_ids: &[String],
            _metric_names: &[String],
        ) -> Result<LatestValues> {
            Ok(self.latest.clone())
        }

        async fn post_host_metric_values(&self, metrics: &[HostMetric]) -> Result<()> {
            let mut failures = self.fail_host_posts.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("host metric post unavailable");
            }
            self.posted_host_batches
                .lock()
                .unwrap()
                .push(metrics.to_vec());
            Ok(())
        }

        async fn post_service_metric_values(
            &self,
            service: &str,
            metrics: &[ServiceMetric],
        ) -> Result<()> {
            let mut failures = self.fail_service_posts.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("service metric post unavailable");
            }
            self.posted_service_batches
                .lock()
                .unwrap()
                .push((service.to_string(), metrics.to_vec()));
            Ok(())
        }
    }
}
