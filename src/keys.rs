//! Key schema and codec for the records shared through the state store.
//!
//! Two key families are used: `exec-count:<namespace>:<job_id>` holding the
//! per-job executor counter record, and `job-ratio:<namespace>:<job_id>`
//! holding the job's cached target spot ratio. Lock records for a key live
//! under a `lock:` prefix of the guarded key.

use std::fmt;

/// The key prefix for executor counter records.
pub const PREFIX_EXEC_COUNT: &str = "exec-count";
/// The key prefix for cached job ratio records.
pub const PREFIX_JOB_RATIO: &str = "job-ratio";
/// The key prefix for lock records.
const PREFIX_LOCK: &str = "lock";

/// Build the counter record key for the given job.
pub fn exec_count(namespace: &str, job_id: &str) -> String {
    format!("{}:{}:{}", PREFIX_EXEC_COUNT, namespace, job_id)
}

/// Build the cached ratio key for the given job.
pub fn job_ratio(namespace: &str, job_id: &str) -> String {
    format!("{}:{}:{}", PREFIX_JOB_RATIO, namespace, job_id)
}

/// Build the lock record key guarding the given key.
pub fn lock(key: &str) -> String {
    format!("{}:{}", PREFIX_LOCK, key)
}

/// Split a counter record key back into `(namespace, job_id)`.
///
/// Namespaces can never contain `:`, so the first separator after the prefix
/// is unambiguous.
pub fn parse_exec_count(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(PREFIX_EXEC_COUNT)?.strip_prefix(':')?;
    rest.split_once(':')
}

/// The two capacity classes offered by the cloud.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CapacityType {
    OnDemand,
    Spot,
}

impl CapacityType {
    /// The label value used on nodes and node selectors for this capacity class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Spot => "spot",
        }
    }

    /// Parse a node-selector value as a capacity class.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "on-demand" => Some(Self::OnDemand),
            "spot" => Some(Self::Spot),
            _ => None,
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-job executor counter record.
///
/// Encoded as the two counts separated by `:`, on-demand first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutorCount {
    /// The number of live executors placed on on-demand capacity.
    pub on_demand: u64,
    /// The number of live executors placed on spot capacity.
    pub spot: u64,
}

impl ExecutorCount {
    pub fn new(on_demand: u64, spot: u64) -> Self {
        Self { on_demand, spot }
    }

    pub fn total(&self) -> u64 {
        self.on_demand + self.spot
    }

    /// Encode this record into its compact stored form.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.on_demand, self.spot)
    }

    /// Decode a stored record.
    ///
    /// A missing key decodes as `(0, 0)`. A malformed value also decodes as
    /// `(0, 0)` with a warning; the next write overwrites it.
    pub fn decode(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(raw) => raw,
            None => return Self::default(),
        };
        match raw.split_once(':').and_then(|(od, spot)| Some(Self::new(od.parse().ok()?, spot.parse().ok()?))) {
            Some(counts) => counts,
            None => {
                tracing::warn!(raw = %raw, "malformed counter record; resetting to (0, 0)");
                Self::default()
            }
        }
    }

    /// The record after admitting one executor of the given capacity.
    pub fn incremented(self, capacity: CapacityType) -> Self {
        match capacity {
            CapacityType::OnDemand => Self::new(self.on_demand + 1, self.spot),
            CapacityType::Spot => Self::new(self.on_demand, self.spot + 1),
        }
    }

    /// The record after releasing one executor of the given capacity, clamped at zero.
    pub fn decremented(self, capacity: CapacityType) -> Self {
        match capacity {
            CapacityType::OnDemand => Self::new(self.on_demand.saturating_sub(1), self.spot),
            CapacityType::Spot => Self::new(self.on_demand, self.spot.saturating_sub(1)),
        }
    }
}

/// Encode a ratio for storage as a decimal string.
///
/// Three decimal places round-trip the full [0.000, 1.000] range.
pub fn encode_ratio(ratio: f64) -> String {
    format!("{:.3}", ratio)
}

/// Decode a stored ratio, clamped to [0.0, 1.0]. NaN and infinities decode as `None`.
pub fn decode_ratio(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|ratio| ratio.is_finite()).map(|ratio| ratio.clamp(0.0, 1.0))
}
