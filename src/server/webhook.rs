//! Admission webhook handlers.
//!
//! Two entry points drive the counter protocol: `mutate` places executor pods
//! on pod CREATE, and `validate` releases their count on pod DELETE. Neither
//! ever blocks a pod: every failure path allows the request unchanged and
//! leaves counter repair to the reconciler.

use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};

use crate::config::Config;
use crate::keys::CapacityType;
use crate::placement;
use crate::server::AppState;
use crate::store::StoreError;

const METRIC_ADMISSION_FAIL_OPEN: &str = "spot_balancer_admission_fail_open";
const METRIC_LOCK_TIMEOUTS: &str = "spot_balancer_lock_timeouts";

/// Register this module's metrics with the global recorder.
pub(super) fn register_metrics() {
    metrics::register_counter!(
        METRIC_ADMISSION_FAIL_OPEN,
        metrics::Unit::Count,
        "admissions allowed without placement due to an internal failure"
    );
    metrics::register_counter!(METRIC_LOCK_TIMEOUTS, metrics::Unit::Count, "counter lock acquisition timeouts");
}

/// Mutating admission handler for pod CREATE.
#[tracing::instrument(level = "debug", skip_all)]
pub(super) async fn mutate(
    Extension(state): Extension<Arc<AppState>>, Json(mut payload): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match payload.request.take() {
        Some(req) => req,
        None => {
            let res = AdmissionResponse::invalid("malformed admission review received, no `request` field");
            return Json(res.into_review());
        }
    };
    if !matches!(req.operation, Operation::Create) {
        return Json(AdmissionResponse::from(&req).into_review());
    }

    let response = match tokio::time::timeout(state.config.webhook_timeout(), mutate_pod(&state, &req)).await {
        Ok(response) => response,
        Err(_elapsed) => {
            tracing::warn!(uid = %req.uid, "admission deadline exceeded; allowing pod unchanged");
            metrics::increment_counter!(METRIC_ADMISSION_FAIL_OPEN);
            AdmissionResponse::from(&req)
        }
    };
    Json(response.into_review())
}

/// Decide placement for the pod and build its node-selector patch.
async fn mutate_pod(state: &AppState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let pod = match &req.object {
        Some(pod) => pod,
        None => return AdmissionResponse::invalid("no pod object found in the `object` field, can not mutate"),
    };
    let config = &state.config;
    if pod_role(config, pod) != Some(config.executor_role_value.as_str()) {
        return response;
    }
    let job_id = match job_id(config, pod) {
        Some(job_id) => job_id,
        None => {
            tracing::debug!("executor pod carries no job id label; allowing unchanged");
            return response;
        }
    };
    if req.dry_run {
        return response;
    }
    let namespace = req.namespace.as_deref().or(pod.metadata.namespace.as_deref()).unwrap_or("default");

    let ratio = state.resolver.resolve(namespace, job_id).await;
    let decision = match placement::admit_executor(state.store.as_ref(), config, namespace, job_id, ratio).await {
        Ok(decision) => decision,
        Err(err) => {
            tracing::error!(error = ?err, namespace = %namespace, job_id = %job_id, "placement failed; allowing pod unchanged");
            if matches!(err, StoreError::LockTimeout(_)) {
                metrics::increment_counter!(METRIC_LOCK_TIMEOUTS);
            }
            metrics::increment_counter!(METRIC_ADMISSION_FAIL_OPEN);
            return response;
        }
    };
    tracing::info!(
        namespace = %namespace,
        job_id = %job_id,
        ratio = %ratio,
        capacity = decision.capacity.map(|capacity| capacity.as_str()).unwrap_or("unlabeled"),
        on_demand = decision.counts.on_demand,
        spot = decision.counts.spot,
        "admitted executor",
    );

    let patch = selector_patch(config, pod, decision.capacity);
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(patched) => patched,
        Err(err) => {
            tracing::error!(error = ?err, "error serializing node selector patch; allowing pod unchanged");
            metrics::increment_counter!(METRIC_ADMISSION_FAIL_OPEN);
            response
        }
    }
}

/// Validating admission handler for pod DELETE.
///
/// Deletion is never blocked; this endpoint only keeps the counters aligned.
#[tracing::instrument(level = "debug", skip_all)]
pub(super) async fn validate(
    Extension(state): Extension<Arc<AppState>>, Json(mut payload): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match payload.request.take() {
        Some(req) => req,
        None => {
            let res = AdmissionResponse::invalid("malformed admission review received, no `request` field");
            return Json(res.into_review());
        }
    };
    let response = AdmissionResponse::from(&req);
    if !matches!(req.operation, Operation::Delete) {
        return Json(response.into_review());
    }
    if let Err(_elapsed) = tokio::time::timeout(state.config.webhook_timeout(), release_pod(&state, &req)).await {
        tracing::warn!(uid = %req.uid, "delete accounting deadline exceeded; allowing");
        metrics::increment_counter!(METRIC_ADMISSION_FAIL_OPEN);
    }
    Json(response.into_review())
}

/// Decrement the counter matching the deleted executor's capacity selector.
async fn release_pod(state: &AppState, req: &AdmissionRequest<Pod>) {
    // DELETE carries the previous pod state under `oldObject`.
    let pod = match req.old_object.as_ref().or(req.object.as_ref()) {
        Some(pod) => pod,
        None => return,
    };
    let config = &state.config;
    if pod_role(config, pod) != Some(config.executor_role_value.as_str()) {
        return;
    }
    let capacity = match capacity_selector(config, pod).and_then(CapacityType::parse) {
        Some(capacity) => capacity,
        None => {
            tracing::debug!("deleted executor carries no recognized capacity selector; nothing to decrement");
            return;
        }
    };
    let job_id = match job_id(config, pod) {
        Some(job_id) => job_id,
        None => return,
    };
    if req.dry_run {
        return;
    }
    let namespace = req.namespace.as_deref().or(pod.metadata.namespace.as_deref()).unwrap_or("default");

    match placement::release_executor(state.store.as_ref(), config, namespace, job_id, capacity).await {
        Ok(counts) => tracing::info!(
            namespace = %namespace,
            job_id = %job_id,
            capacity = %capacity,
            on_demand = counts.on_demand,
            spot = counts.spot,
            "released executor",
        ),
        Err(err) => {
            tracing::error!(error = ?err, namespace = %namespace, job_id = %job_id, "error decrementing executor counter");
            metrics::increment_counter!(METRIC_ADMISSION_FAIL_OPEN);
        }
    }
}

/// The pod's workload role label value, if any.
fn pod_role<'a>(config: &Config, pod: &'a Pod) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|labels| labels.get(&config.workload_role_label)).map(String::as_str)
}

/// The pod's job identifier label value, if any.
fn job_id<'a>(config: &Config, pod: &'a Pod) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|labels| labels.get(&config.job_id_label)).map(String::as_str)
}

/// The pod's capacity-type node-selector value, if any.
fn capacity_selector<'a>(config: &Config, pod: &'a Pod) -> Option<&'a str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref())
        .and_then(|selector| selector.get(&config.capacity_type_label))
        .map(String::as_str)
}

/// Build the JSON patch injecting the workload-role and capacity-type node selectors.
///
/// When the pod already carries a node selector, the patch replaces only the
/// managed keys and leaves the remaining entries in place. A `None` capacity
/// (best-effort mode) injects the workload-role selector alone.
fn selector_patch(config: &Config, pod: &Pod, capacity: Option<CapacityType>) -> Patch {
    let mut entries = vec![(config.workload_role_label.clone(), config.executor_role_value.clone())];
    if let Some(capacity) = capacity {
        entries.push((config.capacity_type_label.clone(), capacity.as_str().to_string()));
    }

    let has_selector = pod.spec.as_ref().and_then(|spec| spec.node_selector.as_ref()).is_some();
    if !has_selector {
        let selector: serde_json::Map<String, serde_json::Value> =
            entries.into_iter().map(|(key, value)| (key, serde_json::Value::String(value))).collect();
        return Patch(vec![PatchOperation::Add(AddOperation {
            path: "/spec/nodeSelector".into(),
            value: serde_json::Value::Object(selector),
        })]);
    }
    Patch(
        entries
            .into_iter()
            .map(|(key, value)| {
                PatchOperation::Add(AddOperation {
                    path: format!("/spec/nodeSelector/{}", escape_pointer(&key)),
                    value: serde_json::Value::String(value),
                })
            })
            .collect(),
    )
}

/// Escape a JSON pointer segment per RFC 6901.
fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
