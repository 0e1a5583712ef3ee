//! Job metadata resolver.
//!
//! Resolves a job's target spot ratio from its driver pod annotation, caching
//! the result in the state store. The cache makes the ratio effectively
//! immutable for a job's lifetime: mid-job annotation changes are ignored
//! until the cache entry expires.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;

use crate::config::Config;
use crate::keys;
use crate::store::KeyValueStore;

/// A source of per-job target spot ratios.
#[async_trait]
pub trait RatioSource: Send + Sync {
    /// Resolve the target spot ratio for the given job.
    ///
    /// Resolution never fails: any lookup problem falls back to the
    /// configured default ratio.
    async fn resolve(&self, namespace: &str, job_id: &str) -> f64;
}

/// The production resolver, reading the spot-ratio annotation from the job's
/// driver pod.
pub struct DriverRatioResolver {
    client: Client,
    config: Arc<Config>,
    store: Arc<dyn KeyValueStore>,
}

impl DriverRatioResolver {
    pub fn new(client: Client, config: Arc<Config>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { client, config, store }
    }

    /// Find the job's driver pod and read its spot-ratio annotation.
    ///
    /// Returns `None` when the driver can not be found or the API call fails,
    /// so those outcomes are not cached and a later lookup can still succeed.
    /// A present driver with a missing or malformed annotation resolves to
    /// the default ratio.
    async fn lookup_driver(&self, namespace: &str, job_id: &str) -> Option<f64> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams {
            label_selector: Some(format!(
                "{}={},{}={}",
                self.config.job_id_label, job_id, self.config.workload_role_label, self.config.driver_role_value,
            )),
            ..Default::default()
        };
        let drivers = match api.list(&params).await {
            Ok(list) => list.items,
            Err(err) => {
                tracing::warn!(error = ?err, namespace = %namespace, job_id = %job_id, "error listing driver pods; using default ratio");
                return None;
            }
        };
        let driver = match drivers.into_iter().next() {
            Some(driver) => driver,
            None => {
                tracing::info!(namespace = %namespace, job_id = %job_id, "no driver pod found for job; using default ratio");
                return None;
            }
        };
        let raw = driver.metadata.annotations.as_ref().and_then(|annotations| annotations.get(&self.config.spot_ratio_annotation));
        let ratio = match raw {
            Some(raw) => match parse_ratio(raw) {
                Some(ratio) => ratio,
                None => {
                    tracing::warn!(raw = %raw, namespace = %namespace, job_id = %job_id, "malformed spot-ratio annotation; using default ratio");
                    self.config.default_spot_ratio
                }
            },
            None => self.config.default_spot_ratio,
        };
        Some(ratio)
    }
}

#[async_trait]
impl RatioSource for DriverRatioResolver {
    async fn resolve(&self, namespace: &str, job_id: &str) -> f64 {
        let key = keys::job_ratio(namespace, job_id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => {
                if let Some(ratio) = keys::decode_ratio(&raw) {
                    return ratio;
                }
                tracing::warn!(key = %key, raw = %raw, "malformed cached ratio; resolving from driver");
            }
            Ok(None) => (),
            Err(err) => tracing::warn!(error = ?err, key = %key, "error reading cached ratio; resolving from driver"),
        }
        match self.lookup_driver(namespace, job_id).await {
            Some(ratio) => {
                if let Err(err) = self.store.set(&key, &keys::encode_ratio(ratio), self.config.record_ttl()).await {
                    tracing::warn!(error = ?err, key = %key, "error caching resolved ratio");
                }
                ratio
            }
            None => self.config.default_spot_ratio,
        }
    }
}

/// Parse an annotation value as a ratio, clamped to [0.0, 1.0].
///
/// NaN and infinities are rejected so they fall back to the default.
pub(crate) fn parse_ratio(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|ratio| ratio.is_finite()).map(|ratio| ratio.clamp(0.0, 1.0))
}
