use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::agent::Runtime;
use crate::backend::{HostQuery, MonitoringBackend};
use crate::config::{AggregateDefinition, ProbeDefinition};
use crate::probe::generate_probes;
use crate::types::{HostMetric, ServiceMetric};

/// Spread probe starts across the tick so a long host list does not
/// stampede the targets or the discovery backend. `interval / (2n)`,
/// capped at one second; zero means start immediately.
fn spawn_interval(probe_interval: Duration, hosts: usize) -> Duration {
    if hosts == 0 {
        return Duration::ZERO;
    }
    let interval = probe_interval / (hosts as u32).saturating_mul(2).max(1);
    interval.min(Duration::from_secs(1))
}

/// Run one probe definition for one tick: discover hosts, fan out one
/// bounded task per host, forward every produced metric. Errors are logged
/// and skip this definition for this tick only.
pub async fn run_probes(
    runtime: Arc<Runtime>,
    definition: ProbeDefinition,
    backend: Arc<dyn MonitoringBackend>,
    tx: mpsc::Sender<HostMetric>,
    cancel: CancellationToken,
) {
    debug!(
        service = %definition.service,
        roles = ?definition.roles,
        statuses = ?definition.statuses,
        "probes finding hosts"
    );
    let query = HostQuery {
        service: definition.service.clone(),
        roles: definition.roles.clone(),
        statuses: definition.statuses.clone(),
    };
    let hosts = match backend.find_hosts(&query).await {
        Ok(hosts) => hosts,
        Err(e) => {
            error!(error = %e, "probes find hosts failed");
            return;
        }
    };
    debug!(count = hosts.len(), "probes hosts found");
    if hosts.is_empty() {
        return;
    }

    let interval = spawn_interval(runtime.probe_interval, hosts.len());
    let mut tasks = JoinSet::new();
    for host in hosts {
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        debug!(host_id = %host.id, host = %host.name, "probes preparing host");

        let runtime = runtime.clone();
        let definition = definition.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            // Scoped permit of the global probe bound; released on every
            // exit path when the task drops it.
            let Ok(_permit) = runtime.probe_sem.clone().acquire_owned().await else {
                return;
            };
            trace!(
                available = runtime.probe_sem.available_permits(),
                "probe slot acquired"
            );
            for probe in generate_probes(&definition, &host) {
                if cancel.is_cancelled() {
                    return;
                }
                debug!(host_id = %host.id, host = %host.name, probe = %probe, "probing host");
                let metrics = match probe.run(&cancel).await {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        warn!(
                            error = %e,
                            host_id = %host.id,
                            host = %host.name,
                            probe = %probe,
                            "probe failed"
                        );
                        e.partial
                    }
                };
                for metric in metrics {
                    if tx.send(metric).await.is_err() {
                        // Shipper is gone; nothing left to deliver to.
                        return;
                    }
                }
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Run one aggregate definition for one tick: discover hosts, fetch their
/// latest values in a single call, drop stale or non-numeric samples, and
/// emit one service metric per output.
pub async fn run_aggregates(
    runtime: Arc<Runtime>,
    definition: AggregateDefinition,
    backend: Arc<dyn MonitoringBackend>,
    tx: mpsc::Sender<ServiceMetric>,
) {
    debug!(
        service = %definition.service,
        roles = ?definition.roles,
        statuses = ?definition.statuses,
        "aggregates finding hosts"
    );
    let query = HostQuery {
        service: definition.service.clone(),
        roles: definition.roles.clone(),
        statuses: definition.statuses.clone(),
    };
    let hosts = match backend.find_hosts(&query).await {
        Ok(hosts) => hosts,
        Err(e) => {
            error!(error = %e, "aggregates find hosts failed");
            return;
        }
    };
    debug!(count = hosts.len(), "aggregates hosts found");
    if hosts.is_empty() {
        return;
    }

    let host_ids: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
    let metric_names: Vec<String> = definition.metrics.iter().map(|m| m.name.clone()).collect();

    debug!(hosts = ?host_ids, metrics = ?metric_names, "fetching latest metric values");
    let latest = match backend
        .fetch_latest_metric_values(&host_ids, &metric_names)
        .await
    {
        Ok(latest) => latest,
        Err(e) => {
            error!(
                error = %e,
                hosts = ?host_ids,
                metrics = ?metric_names,
                "fetch latest metric values failed"
            );
            return;
        }
    };

    let now = Utc::now();
    for mc in &definition.metrics {
        let mut values: Vec<f64> = Vec::new();
        let mut newest: i64 = 0;
        for (host_id, metrics) in &latest {
            let Some(entry) = metrics.get(&mc.name) else {
                continue;
            };
            let Some(lv) = entry else {
                debug!(host_id = %host_id, metric = %mc.name, "latest value not found");
                continue;
            };
            let Some(raw) = &lv.value else {
                debug!(host_id = %host_id, metric = %mc.name, "latest value not found");
                continue;
            };
            let Some(value) = raw.as_f64() else {
                warn!(
                    host_id = %host_id,
                    metric = %mc.name,
                    value = %raw,
                    "latest value is not a number"
                );
                continue;
            };
            let sample_time = DateTime::from_timestamp(lv.time, 0).unwrap_or_default();
            trace!(host_id = %host_id, metric = %mc.name, time = lv.time, value, "latest value");
            if sample_time > now + runtime.metric_time_margin {
                values.push(value);
                newest = newest.max(lv.time);
            } else {
                warn!(
                    host_id = %host_id,
                    metric = %mc.name,
                    at = %sample_time,
                    "latest value is outdated"
                );
            }
        }
        if values.is_empty() {
            continue;
        }

        let timestamp = DateTime::from_timestamp(newest, 0).unwrap_or_else(Utc::now);
        for output in &mc.outputs {
            // Unknown funcs were warned about at validation and emit nothing.
            let Some(reducer) = output.reducer else {
                continue;
            };
            let value = reducer.apply(&values);
            debug!(
                func = %reducer,
                metric = %mc.name,
                value,
                service = %definition.service,
                output = %output.name,
                "aggregated"
            );
            let metric = ServiceMetric {
                service: definition.service.clone(),
                name: output.name.clone(),
                value,
                timestamp,
            };
            if tx.send(metric).await.is_err() {
                return;
            }
        }
    }
}
