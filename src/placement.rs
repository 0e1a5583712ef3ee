//! Placement decision engine.
//!
//! The engine itself is a pure function over the current counter record and
//! the job's target ratio. The surrounding operations bracket exactly one
//! read-decide-write cycle in the per-key distributed lock, which serializes
//! all counter updates for a job and yields a total order over its placement
//! decisions.

use crate::config::{Config, SpotPreference};
use crate::keys::{self, CapacityType, ExecutorCount};
use crate::store::{KeyValueStore, StoreError, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL};

/// The outcome of one admission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// The chosen capacity type; `None` leaves the pod unlabeled (best-effort mode).
    pub capacity: Option<CapacityType>,
    /// The counter record after the decision was applied.
    pub counts: ExecutorCount,
}

/// Choose the capacity type for the next executor.
///
/// Picks whichever side brings the job's resulting spot fraction closest to
/// the target ratio. Distances are compared in units of executors rather
/// than fractions so that ties stay exact under floating point; ties go to
/// spot, which also gives the first executor of a `ratio >= 0.5` job a spot
/// placement.
pub fn decide(counts: ExecutorCount, ratio: f64) -> CapacityType {
    if ratio >= 1.0 {
        return CapacityType::Spot;
    }
    if ratio <= 0.0 {
        return CapacityType::OnDemand;
    }
    let target = ratio * (counts.total() + 1) as f64;
    let spot_dist = ((counts.spot + 1) as f64 - target).abs();
    let on_demand_dist = (counts.spot as f64 - target).abs();
    if spot_dist <= on_demand_dist {
        CapacityType::Spot
    } else {
        CapacityType::OnDemand
    }
}

/// Admit one executor for the given job, updating its counter record.
///
/// Under `BEST_EFFORT` this short-circuits before any store traffic: the pod
/// stays unlabeled and the counters untouched, as the autoscaler may still
/// place it on spot opportunistically.
pub async fn admit_executor<S>(
    store: &S, config: &Config, namespace: &str, job_id: &str, ratio: f64,
) -> Result<Decision, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    if config.spot_preference == SpotPreference::BestEffort {
        return Ok(Decision { capacity: None, counts: ExecutorCount::default() });
    }
    let key = keys::exec_count(namespace, job_id);
    let token = store.acquire_lock(&key, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL).await?;
    let result = async {
        let counts = ExecutorCount::decode(store.get(&key).await?.as_deref());
        let capacity = decide(counts, ratio);
        let updated = counts.incremented(capacity);
        store.set(&key, &updated.encode(), config.record_ttl()).await?;
        Ok(Decision { capacity: Some(capacity), counts: updated })
    }
    .await;
    if let Err(err) = store.release_lock(&key, token).await {
        tracing::warn!(error = ?err, key = %key, "error releasing counter lock; TTL will reclaim it");
    }
    result
}

/// Release one executor of the given capacity, decrementing the job's counter.
///
/// Counts clamp at zero so a duplicate or unmatched delete can never drive a
/// record negative.
pub async fn release_executor<S>(
    store: &S, config: &Config, namespace: &str, job_id: &str, capacity: CapacityType,
) -> Result<ExecutorCount, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    let key = keys::exec_count(namespace, job_id);
    let token = store.acquire_lock(&key, LOCK_ACQUIRE_TIMEOUT, LOCK_TTL).await?;
    let result = async {
        let counts = ExecutorCount::decode(store.get(&key).await?.as_deref());
        let updated = counts.decremented(capacity);
        store.set(&key, &updated.encode(), config.record_ttl()).await?;
        Ok(updated)
    }
    .await;
    if let Err(err) = store.release_lock(&key, token).await {
        tracing::warn!(error = ?err, key = %key, "error releasing counter lock; TTL will reclaim it");
    }
    result
}
