//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The two operating modes of the placement engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpotPreference {
    /// Enforce the target ratio with counters and capacity-type selectors.
    Strict,
    /// Emit no capacity label and keep no state; the autoscaler places pods
    /// on spot opportunistically.
    BestEffort,
}

impl Default for SpotPreference {
    fn default() -> Self {
        Self::BestEffort
    }
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity, using `tracing_subscriber` filter directives.
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
    /// The port used for the admission HTTP endpoints and healthchecks.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The placement engine's operating mode.
    #[serde(default)]
    pub spot_preference: SpotPreference,
    /// Fallback target spot ratio used when a job declares none.
    #[serde(default = "Config::default_spot_ratio")]
    pub default_spot_ratio: f64,
    /// Upper bound in seconds on a single admission handler invocation.
    #[serde(default = "Config::default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,

    /// The state store endpoint.
    pub redis_url: String,
    /// TTL in seconds applied to counter and ratio records.
    #[serde(default = "Config::default_redis_ttl")]
    pub redis_default_ttl_seconds: u64,

    /// The node-selector key steering scheduling toward spot or on-demand.
    #[serde(default = "Config::default_capacity_type_label")]
    pub capacity_type_label: String,
    /// The pod label key carrying the workload role.
    #[serde(default = "Config::default_workload_role_label")]
    pub workload_role_label: String,
    /// The role label value identifying driver pods.
    #[serde(default = "Config::default_driver_role_value")]
    pub driver_role_value: String,
    /// The role label value identifying executor pods.
    #[serde(default = "Config::default_executor_role_value")]
    pub executor_role_value: String,
    /// The pod label key carrying the job identifier.
    #[serde(default = "Config::default_job_id_label")]
    pub job_id_label: String,
    /// The driver-pod annotation key carrying the target spot ratio.
    #[serde(default = "Config::default_spot_ratio_annotation")]
    pub spot_ratio_annotation: String,

    /// Whether the background reconciler is enabled.
    #[serde(default = "Config::default_reconcile_enabled")]
    pub reconcile_enabled: bool,
    /// Seconds between reconciler passes.
    #[serde(default = "Config::default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validated()
    }

    /// Validate option values and apply bounds, consuming the raw parsed form.
    pub fn validated(mut self) -> Result<Self> {
        ensure!(!self.redis_url.is_empty(), "REDIS_URL is required but not set");
        ensure!(
            self.default_spot_ratio.is_finite(),
            "DEFAULT_SPOT_RATIO must be a finite number in [0.0, 1.0], got {}",
            self.default_spot_ratio,
        );
        ensure!(self.webhook_timeout_seconds >= 1, "WEBHOOK_TIMEOUT_SECONDS must be at least 1");
        self.default_spot_ratio = self.default_spot_ratio.clamp(0.0, 1.0);
        self.redis_default_ttl_seconds = self.redis_default_ttl_seconds.max(1);
        self.reconcile_interval_seconds = self.reconcile_interval_seconds.max(60);
        Ok(self)
    }

    /// The deadline applied to a single admission handler invocation.
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds)
    }

    /// The TTL applied to counter and ratio records in the state store.
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.redis_default_ttl_seconds)
    }

    /// The interval between reconciler passes.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    fn default_log_level() -> String {
        "info".into()
    }

    fn default_http_port() -> u16 {
        8443
    }

    fn default_spot_ratio() -> f64 {
        0.5
    }

    fn default_webhook_timeout() -> u64 {
        5
    }

    fn default_redis_ttl() -> u64 {
        86400
    }

    fn default_capacity_type_label() -> String {
        "karpenter.sh/capacity-type".into()
    }

    fn default_workload_role_label() -> String {
        "spark-role".into()
    }

    fn default_driver_role_value() -> String {
        "driver".into()
    }

    fn default_executor_role_value() -> String {
        "executor".into()
    }

    fn default_job_id_label() -> String {
        "emr-containers.amazonaws.com/job.id".into()
    }

    fn default_spot_ratio_annotation() -> String {
        "workload/spot-ratio".into()
    }

    fn default_reconcile_enabled() -> bool {
        true
    }

    fn default_reconcile_interval() -> u64 {
        1800
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            log_level: "".into(),
            http_port: 8443,
            spot_preference: SpotPreference::Strict,
            default_spot_ratio: 0.5,
            webhook_timeout_seconds: 5,
            redis_url: "redis://localhost:6379".into(),
            redis_default_ttl_seconds: 86400,
            capacity_type_label: Self::default_capacity_type_label(),
            workload_role_label: Self::default_workload_role_label(),
            driver_role_value: Self::default_driver_role_value(),
            executor_role_value: Self::default_executor_role_value(),
            job_id_label: Self::default_job_id_label(),
            spot_ratio_annotation: Self::default_spot_ratio_annotation(),
            reconcile_enabled: true,
            reconcile_interval_seconds: 1800,
        })
    }
}
