//! Shared test fixtures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::AdmissionReview;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::resolver::RatioSource;
use crate::store::{KeyValueStore, LockToken, StoreError};

/// An in-memory stand-in for the shared state store.
///
/// TTLs are ignored; tests never run long enough for expiry to matter.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<HashMap<String, String>>,
    locks: Mutex<HashSet<String>>,
}

impl MemStore {
    /// Read a raw record directly, bypassing the store interface.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.data.lock().await.get(key).cloned()
    }

    /// Seed a raw record directly, bypassing the store interface.
    pub async fn seed(&self, key: &str, value: &str) {
        self.data.lock().await.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl KeyValueStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.data.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.data.lock().await.keys().filter(|key| key.starts_with(prefix)).cloned().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration, _ttl: Duration) -> Result<LockToken, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut locks = self.locks.lock().await;
                if !locks.contains(key) {
                    locks.insert(key.to_string());
                    return Ok(LockToken(key.to_string()));
                }
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn release_lock(&self, key: &str, _token: LockToken) -> Result<(), StoreError> {
        self.locks.lock().await.remove(key);
        Ok(())
    }
}

/// A ratio source answering with a fixed value, standing in for the driver lookup.
pub struct FixedRatio(pub f64);

#[async_trait]
impl RatioSource for FixedRatio {
    async fn resolve(&self, _namespace: &str, _job_id: &str) -> f64 {
        self.0
    }
}

/// Build an executor pod for the given job, optionally carrying a capacity-type selector.
pub fn executor_pod(config: &Config, namespace: &str, name: &str, job_id: &str, capacity: Option<&str>) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(config.workload_role_label.clone(), config.executor_role_value.clone());
    labels.insert(config.job_id_label.clone(), job_id.to_string());
    let node_selector = capacity.map(|capacity| {
        let mut selector = BTreeMap::new();
        selector.insert(config.capacity_type_label.clone(), capacity.to_string());
        selector
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec { node_selector, ..Default::default() }),
        ..Default::default()
    }
}

/// Build an admission review envelope around the given pod.
pub fn admission_review(operation: &str, object: Option<&Pod>, old_object: Option<&Pod>) -> Result<AdmissionReview<Pod>> {
    let object = match object {
        Some(pod) => serde_json::to_value(pod).context("error serializing pod object")?,
        None => serde_json::Value::Null,
    };
    let old_object = match old_object {
        Some(pod) => serde_json::to_value(pod).context("error serializing old pod object")?,
        None => serde_json::Value::Null,
    };
    serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "test-uid",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": operation,
            "userInfo": {},
            "object": object,
            "oldObject": old_object,
        },
    }))
    .context("error building admission review")
}
