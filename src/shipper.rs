use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::Runtime;
use crate::backend::{HostMetricValue, MetricValue, MonitoringBackend};
use crate::types::{HostMetric, ServiceMetric};

/// Buffers host metrics and posts them upstream in batches.
///
/// A flush happens when the buffer reaches the configured cap, when the
/// flush timer fires with a non-empty buffer, and once more when the
/// channel closes. A failed post keeps the buffer as-is and backs off for
/// the retry interval, so delivery is at-least-once with a backlog bounded
/// by the channel capacity.
pub async fn post_host_metric_worker(
    runtime: Arc<Runtime>,
    backend: Arc<dyn MonitoringBackend>,
    mut rx: mpsc::Receiver<HostMetric>,
) {
    let cap = runtime.post_metric_buffer_length;
    let mut ticker = tokio::time::interval(runtime.flush_interval);
    ticker.tick().await; // the first tick completes immediately
    let mut buffer: Vec<HostMetric> = Vec::with_capacity(cap);
    let mut open = true;
    while open {
        tokio::select! {
            received = rx.recv() => match received {
                Some(metric) => {
                    buffer.push(metric);
                    if buffer.len() < cap {
                        continue;
                    }
                }
                None => {
                    debug!("shutting down host metric worker");
                    open = false;
                }
            },
            _ = ticker.tick() => {}
        }
        if buffer.is_empty() {
            continue;
        }
        debug!(count = buffer.len(), "posting host metrics");
        if let Err(e) = backend.post_host_metric_values(&buffer).await {
            error!(error = %e, "failed to post host metrics");
            tokio::time::sleep(runtime.retry_interval).await;
            continue;
        }
        debug!("post succeeded");
        buffer.clear();
    }
}

/// Service-metric counterpart of [`post_host_metric_worker`]. The buffer
/// may span services; a flush posts one batch per service and retains only
/// the groups whose post failed.
pub async fn post_service_metric_worker(
    runtime: Arc<Runtime>,
    backend: Arc<dyn MonitoringBackend>,
    mut rx: mpsc::Receiver<ServiceMetric>,
) {
    let cap = runtime.post_metric_buffer_length;
    let mut ticker = tokio::time::interval(runtime.flush_interval);
    ticker.tick().await;
    let mut buffer: Vec<ServiceMetric> = Vec::with_capacity(cap);
    let mut open = true;
    while open {
        tokio::select! {
            received = rx.recv() => match received {
                Some(metric) => {
                    buffer.push(metric);
                    if buffer.len() < cap {
                        continue;
                    }
                }
                None => {
                    debug!("shutting down service metric worker");
                    open = false;
                }
            },
            _ = ticker.tick() => {}
        }
        if buffer.is_empty() {
            continue;
        }
        debug!(count = buffer.len(), "posting service metrics");

        let mut groups: Vec<(String, Vec<ServiceMetric>)> = Vec::new();
        for metric in buffer.drain(..) {
            match groups.iter_mut().find(|(s, _)| *s == metric.service) {
                Some((_, batch)) => batch.push(metric),
                None => groups.push((metric.service.clone(), vec![metric])),
            }
        }

        let mut failed = false;
        for (service, batch) in groups {
            if let Err(e) = backend.post_service_metric_values(&service, &batch).await {
                error!(error = %e, service = %service, "failed to post service metrics");
                buffer.extend(batch);
                failed = true;
            }
        }
        if failed {
            tokio::time::sleep(runtime.retry_interval).await;
            continue;
        }
        debug!("post succeeded");
    }
}

/// Drains the channel and logs each metric in its upstream wire form.
/// Used instead of the posting worker when uploading is disabled.
pub async fn dump_host_metric_worker(mut rx: mpsc::Receiver<HostMetric>) {
    while let Some(metric) = rx.recv().await {
        match serde_json::to_string(&HostMetricValue::from(&metric)) {
            Ok(json) => info!(host_id = %metric.host_id, "{}", json),
            Err(e) => warn!(error = %e, "cannot serialize host metric"),
        }
    }
}

pub async fn dump_service_metric_worker(mut rx: mpsc::Receiver<ServiceMetric>) {
    while let Some(metric) = rx.recv().await {
        match serde_json::to_string(&MetricValue::from(&metric)) {
            Ok(json) => info!(service = %metric.service, "{}", json),
            Err(e) => warn!(error = %e, "cannot serialize service metric"),
        }
    }
}
