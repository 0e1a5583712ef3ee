//! Ground-truth reconciliation.
//!
//! A background loop which periodically recomputes every job's executor
//! counts from the live pods in the cluster and overwrites the stored
//! records. Reconciliation is the tiebreaker against drift from missed
//! admission or delete events, webhook downtime, and manual pod
//! manipulation: it overwrites without merging.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::keys::{self, CapacityType, ExecutorCount};
use crate::store::{KeyValueStore, StoreError, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL};

const METRIC_RECONCILE_RUNS: &str = "spot_balancer_reconcile_runs";
const METRIC_RECONCILE_ERRORS: &str = "spot_balancer_reconcile_errors";
const METRIC_RECONCILE_SKIPPED_GROUPS: &str = "spot_balancer_reconcile_skipped_groups";

/// Executor counts grouped by `(namespace, job_id)`.
type JobCounts = HashMap<(String, String), ExecutorCount>;

/// The background reconciliation task.
pub struct Reconciler {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The shared state store holding counter records.
    store: Arc<dyn KeyValueStore>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, store: Arc<dyn KeyValueStore>, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_counter!(METRIC_RECONCILE_RUNS, metrics::Unit::Count, "reconciliation passes started");
        metrics::register_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "reconciliation passes which failed");
        metrics::register_counter!(
            METRIC_RECONCILE_SKIPPED_GROUPS,
            metrics::Unit::Count,
            "job groups skipped during reconciliation and deferred to the next pass"
        );
        Self { client, config, store, shutdown: BroadcastStream::new(shutdown) }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_seconds = self.config.reconcile_interval_seconds, "reconciler initialized");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics::increment_counter!(METRIC_RECONCILE_RUNS);
                    if let Err(err) = self.reconcile().await {
                        tracing::error!(error = ?err, "reconcile pass failed");
                        metrics::increment_counter!(METRIC_RECONCILE_ERRORS);
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("reconciler shutdown");
        Ok(())
    }

    /// Run one full reconciliation pass.
    async fn reconcile(&self) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams {
            label_selector: Some(format!(
                "{}={},{}",
                self.config.workload_role_label, self.config.executor_role_value, self.config.job_id_label,
            )),
            ..Default::default()
        };
        let pods = api.list(&params).await.context("error listing executor pods")?;
        let observed = group_executors(&self.config, &pods.items);

        for ((namespace, job_id), counts) in &observed {
            if let Err(err) = overwrite_counts(self.store.as_ref(), &self.config, namespace, job_id, *counts).await {
                tracing::warn!(
                    error = ?err,
                    namespace = %namespace,
                    job_id = %job_id,
                    "error overwriting counter record; deferring group to next pass",
                );
                metrics::increment_counter!(METRIC_RECONCILE_SKIPPED_GROUPS);
            }
        }
        self.reap_departed(&observed).await;

        tracing::info!(jobs = observed.len(), "reconciled executor counters");
        Ok(())
    }

    /// Delete records for jobs with no live executors and no remaining driver.
    async fn reap_departed(&self, observed: &JobCounts) {
        let stored = match self.store.scan(&format!("{}:", keys::PREFIX_EXEC_COUNT)).await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(error = ?err, "error scanning counter keys; skipping reap");
                return;
            }
        };
        for key in stored {
            let (namespace, job_id) = match keys::parse_exec_count(&key) {
                Some(parts) => parts,
                None => continue,
            };
            if observed.contains_key(&(namespace.to_string(), job_id.to_string())) {
                continue;
            }
            match self.driver_exists(namespace, job_id).await {
                // Zero executors and the driver is gone: the job has departed.
                Some(false) => (),
                // Driver still present, or the probe failed: keep the record.
                _ => continue,
            }
            if let Err(err) = self.reap_job(namespace, job_id).await {
                tracing::warn!(error = ?err, namespace = %namespace, job_id = %job_id, "error reaping departed job records");
            }
        }
    }

    /// Whether the job's driver pod still exists; `None` when the probe failed.
    async fn driver_exists(&self, namespace: &str, job_id: &str) -> Option<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams {
            label_selector: Some(format!(
                "{}={},{}={}",
                self.config.job_id_label, job_id, self.config.workload_role_label, self.config.driver_role_value,
            )),
            limit: Some(1),
            ..Default::default()
        };
        match api.list(&params).await {
            Ok(list) => Some(!list.items.is_empty()),
            Err(err) => {
                tracing::warn!(error = ?err, namespace = %namespace, job_id = %job_id, "error probing driver pod; keeping records");
                None
            }
        }
    }

    /// Delete a departed job's counter and cached ratio records.
    async fn reap_job(&self, namespace: &str, job_id: &str) -> Result<(), StoreError> {
        let key = keys::exec_count(namespace, job_id);
        let token = self.store.acquire_lock(&key, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL).await?;
        let result = async {
            self.store.delete(&key).await?;
            self.store.delete(&keys::job_ratio(namespace, job_id)).await
        }
        .await;
        if let Err(err) = self.store.release_lock(&key, token).await {
            tracing::warn!(error = ?err, key = %key, "error releasing counter lock; TTL will reclaim it");
        }
        if result.is_ok() {
            tracing::info!(namespace = %namespace, job_id = %job_id, "reaped records for departed job");
        }
        result
    }
}

/// Group live executor pods by job, counting by capacity-type selector.
///
/// Pods already marked for deletion are skipped. Pods without a recognized
/// capacity selector still mark their job as observed but count toward
/// neither side.
pub(crate) fn group_executors(config: &Config, pods: &[Pod]) -> JobCounts {
    let mut groups = JobCounts::new();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let namespace = match pod.metadata.namespace.as_deref() {
            Some(namespace) => namespace,
            None => continue,
        };
        let job_id = match pod.metadata.labels.as_ref().and_then(|labels| labels.get(&config.job_id_label)) {
            Some(job_id) => job_id,
            None => continue,
        };
        let entry = groups.entry((namespace.to_string(), job_id.to_string())).or_default();
        let capacity = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_selector.as_ref())
            .and_then(|selector| selector.get(&config.capacity_type_label))
            .and_then(|raw| CapacityType::parse(raw));
        match capacity {
            Some(CapacityType::OnDemand) => entry.on_demand += 1,
            Some(CapacityType::Spot) => entry.spot += 1,
            None => (),
        }
    }
    groups
}

/// Overwrite a job's counter record with counts computed from ground truth.
pub(crate) async fn overwrite_counts<S>(
    store: &S, config: &Config, namespace: &str, job_id: &str, counts: ExecutorCount,
) -> Result<(), StoreError>
where
    S: KeyValueStore + ?Sized,
{
    let key = keys::exec_count(namespace, job_id);
    let token = store.acquire_lock(&key, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL).await?;
    let result = store.set(&key, &counts.encode(), config.record_ttl()).await;
    if let Err(err) = store.release_lock(&key, token).await {
        tracing::warn!(error = ?err, key = %key, "error releasing counter lock; TTL will reclaim it");
    }
    result
}
