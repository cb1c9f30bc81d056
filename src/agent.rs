use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{MackerelClient, MonitoringBackend};
use crate::config::Config;
use crate::runner::{run_aggregates, run_probes};
use crate::shipper::{
    dump_host_metric_worker, dump_service_metric_worker, post_host_metric_worker,
    post_service_metric_worker,
};

/// Process-wide tunables and the two concurrency bounds, built once at
/// startup and passed down instead of living in globals.
pub struct Runtime {
    pub max_concurrency: usize,
    pub max_client_concurrency: usize,
    pub post_metric_buffer_length: usize,
    pub probe_interval: Duration,
    pub flush_interval: Duration,
    pub retry_interval: Duration,
    /// Negative margin; aggregation accepts a sample iff its time is after
    /// `now + margin`.
    pub metric_time_margin: chrono::Duration,
    /// Bounds concurrently running host probe tasks across all definitions.
    pub probe_sem: Arc<Semaphore>,
    /// Bounds concurrent calls against the upstream API.
    pub client_sem: Arc<Semaphore>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_limits(100, 5, 100, Duration::from_secs(60))
    }
}

impl Runtime {
    pub fn with_limits(
        max_concurrency: usize,
        max_client_concurrency: usize,
        post_metric_buffer_length: usize,
        probe_interval: Duration,
    ) -> Self {
        Self {
            max_concurrency,
            max_client_concurrency,
            post_metric_buffer_length,
            probe_interval,
            flush_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(10),
            metric_time_margin: chrono::Duration::minutes(-3),
            probe_sem: Arc::new(Semaphore::new(max_concurrency)),
            client_sem: Arc::new(Semaphore::new(max_client_concurrency)),
        }
    }

    pub fn channel_capacity(&self) -> usize {
        self.post_metric_buffer_length * 10
    }
}

/// Load the configuration, build the upstream client and run the agent
/// until cancellation (or one cycle in once mode). An initial load failure
/// aborts startup.
pub async fn run(
    runtime: Arc<Runtime>,
    location: &str,
    once: bool,
    cancel: CancellationToken,
) -> Result<()> {
    info!("starting hostprobe");
    let config = Config::load(location).await?;
    debug!(config = %config, "loaded configuration");

    let backend: Arc<dyn MonitoringBackend> =
        Arc::new(MackerelClient::new(&config.apikey, runtime.client_sem.clone())?);

    let result = run_with_backend(runtime, config, backend, once, cancel).await;
    info!("stopping hostprobe");
    result
}

/// The orchestrator loop, split from [`run`] so tests can inject a backend.
///
/// Workers are wired from the initial config; the backend client lives for
/// the whole run. Each tick fans out one task per definition, joins them
/// all, then sleeps until the ticker or cancellation fires and attempts a
/// config reload.
pub async fn run_with_backend(
    runtime: Arc<Runtime>,
    mut config: Config,
    backend: Arc<dyn MonitoringBackend>,
    once: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let location = config.location().to_string();

    let (host_tx, host_rx) = mpsc::channel(runtime.channel_capacity());
    let (service_tx, service_rx) = mpsc::channel(runtime.channel_capacity());

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    if config.probes.is_empty() {
        drop(host_rx);
    } else if config.post_probed_metrics {
        workers.push(tokio::spawn(post_host_metric_worker(
            runtime.clone(),
            backend.clone(),
            host_rx,
        )));
    } else {
        workers.push(tokio::spawn(dump_host_metric_worker(host_rx)));
    }
    if config.aggregates.is_empty() {
        drop(service_rx);
    } else if config.post_aggregated_metrics {
        workers.push(tokio::spawn(post_service_metric_worker(
            runtime.clone(),
            backend.clone(),
            service_rx,
        )));
    } else {
        workers.push(tokio::spawn(dump_service_metric_worker(service_rx)));
    }

    let mut ticker = tokio::time::interval(runtime.probe_interval);
    ticker.tick().await; // the first tick completes immediately

    loop {
        let mut tasks = JoinSet::new();
        for pd in &config.probes {
            tasks.spawn(run_probes(
                runtime.clone(),
                pd.clone(),
                backend.clone(),
                host_tx.clone(),
                cancel.clone(),
            ));
        }
        for ad in &config.aggregates {
            tasks.spawn(run_aggregates(
                runtime.clone(),
                ad.clone(),
                backend.clone(),
                service_tx.clone(),
            ));
        }
        while tasks.join_next().await.is_some() {}

        if once {
            break;
        }

        debug!("waiting for the next tick");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("checking for a new config");
        match Config::load(&location).await {
            Ok(new_config) => {
                if new_config != config {
                    config = new_config;
                    info!("config reloaded");
                    debug!(config = %config, "running configuration");
                }
            }
            Err(e) => {
                warn!(error = %e, "config reload failed, still using current config");
            }
        }
    }

    // Closing the channels lets the shippers flush what they hold and exit.
    drop(host_tx);
    drop(service_tx);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockBackend;
    use crate::types::Host;

    fn backend_with_host() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            hosts: vec![Host {
                id: "h1".into(),
                name: "web01".into(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn probe_config_yaml(post: bool) -> String {
        format!(
            r#"
apikey: test-key
post_probed_metrics: {}
probes:
  - service: web
    role: app
    command:
      command: "printf 'custom.ok\t1\t1700000000\n'"
"#,
            post
        )
    }

    #[tokio::test]
    async fn once_mode_posts_probed_metrics_through_the_worker() {
        let config = Config::from_yaml_for_tests(&probe_config_yaml(true));
        let backend = backend_with_host();
        run_with_backend(
            Arc::new(Runtime::default()),
            config,
            backend.clone(),
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let batches = backend.posted_host_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].host_id, "h1");
        assert_eq!(batches[0][0].name, "custom.ok");
    }

    #[tokio::test]
    async fn disabled_posting_dumps_instead_of_posting() {
        let config = Config::from_yaml_for_tests(&probe_config_yaml(false));
        let backend = backend_with_host();
        run_with_backend(
            Arc::new(Runtime::default()),
            config,
            backend.clone(),
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // The dump worker drained the channel; nothing reached the backend.
        assert!(backend.posted_host_batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn once_mode_posts_aggregated_metrics() {
        let now = chrono::Utc::now().timestamp();
        let mut latest = crate::types::LatestValues::new();
        latest.entry("h1".into()).or_default().insert(
            "loadavg5".into(),
            Some(crate::types::LatestValue {
                time: now,
                value: Some(serde_json::json!(1.5)),
            }),
        );
        let backend = Arc::new(MockBackend {
            hosts: vec![Host {
                id: "h1".into(),
                ..Default::default()
            }],
            latest,
            ..Default::default()
        });

        let config = Config::from_yaml_for_tests(
            r#"
apikey: test-key
aggregates:
  - service: web
    role: app
    metrics:
      - name: loadavg5
        outputs:
          - func: max
            name: loadavg5.max
"#,
        );
        run_with_backend(
            Arc::new(Runtime::default()),
            config,
            backend.clone(),
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let batches = backend.posted_service_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "web");
        assert_eq!(batches[0].1[0].name, "loadavg5.max");
        assert_eq!(batches[0].1[0].value, 1.5);
    }
}
