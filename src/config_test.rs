use anyhow::Result;

use crate::config::{Config, SpotPreference};

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("LOG_LEVEL".into(), "error".into()),
        ("HTTP_PORT".into(), "9443".into()),
        ("SPOT_PREFERENCE".into(), "STRICT".into()),
        ("DEFAULT_SPOT_RATIO".into(), "0.7".into()),
        ("WEBHOOK_TIMEOUT_SECONDS".into(), "3".into()),
        ("REDIS_URL".into(), "redis://redis.kube-system:6379".into()),
        ("REDIS_DEFAULT_TTL_SECONDS".into(), "3600".into()),
        ("CAPACITY_TYPE_LABEL".into(), "node.example.com/capacity".into()),
        ("WORKLOAD_ROLE_LABEL".into(), "workload-role".into()),
        ("DRIVER_ROLE_VALUE".into(), "coordinator".into()),
        ("EXECUTOR_ROLE_VALUE".into(), "worker".into()),
        ("JOB_ID_LABEL".into(), "batch.example.com/job-id".into()),
        ("SPOT_RATIO_ANNOTATION".into(), "batch.example.com/spot-ratio".into()),
        ("RECONCILE_ENABLED".into(), "false".into()),
        ("RECONCILE_INTERVAL_SECONDS".into(), "600".into()),
    ])?;
    let config = config.validated()?;

    assert!(config.log_level == "error", "unexpected value parsed for LOG_LEVEL, got {}, expected {}", config.log_level, "error");
    assert!(config.http_port == 9443, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, "9443");
    assert!(
        config.spot_preference == SpotPreference::Strict,
        "unexpected value parsed for SPOT_PREFERENCE, got {:?}, expected {:?}",
        config.spot_preference,
        SpotPreference::Strict,
    );
    assert!(
        (config.default_spot_ratio - 0.7).abs() < f64::EPSILON,
        "unexpected value parsed for DEFAULT_SPOT_RATIO, got {}, expected {}",
        config.default_spot_ratio,
        "0.7",
    );
    assert!(
        config.webhook_timeout_seconds == 3,
        "unexpected value parsed for WEBHOOK_TIMEOUT_SECONDS, got {}, expected {}",
        config.webhook_timeout_seconds,
        "3",
    );
    assert!(
        config.redis_url == "redis://redis.kube-system:6379",
        "unexpected value parsed for REDIS_URL, got {}, expected {}",
        config.redis_url,
        "redis://redis.kube-system:6379",
    );
    assert!(
        config.redis_default_ttl_seconds == 3600,
        "unexpected value parsed for REDIS_DEFAULT_TTL_SECONDS, got {}, expected {}",
        config.redis_default_ttl_seconds,
        "3600",
    );
    assert!(
        config.capacity_type_label == "node.example.com/capacity",
        "unexpected value parsed for CAPACITY_TYPE_LABEL, got {}, expected {}",
        config.capacity_type_label,
        "node.example.com/capacity",
    );
    assert!(
        config.workload_role_label == "workload-role",
        "unexpected value parsed for WORKLOAD_ROLE_LABEL, got {}, expected {}",
        config.workload_role_label,
        "workload-role",
    );
    assert!(
        config.driver_role_value == "coordinator",
        "unexpected value parsed for DRIVER_ROLE_VALUE, got {}, expected {}",
        config.driver_role_value,
        "coordinator",
    );
    assert!(
        config.executor_role_value == "worker",
        "unexpected value parsed for EXECUTOR_ROLE_VALUE, got {}, expected {}",
        config.executor_role_value,
        "worker",
    );
    assert!(
        config.job_id_label == "batch.example.com/job-id",
        "unexpected value parsed for JOB_ID_LABEL, got {}, expected {}",
        config.job_id_label,
        "batch.example.com/job-id",
    );
    assert!(
        config.spot_ratio_annotation == "batch.example.com/spot-ratio",
        "unexpected value parsed for SPOT_RATIO_ANNOTATION, got {}, expected {}",
        config.spot_ratio_annotation,
        "batch.example.com/spot-ratio",
    );
    assert!(!config.reconcile_enabled, "unexpected value parsed for RECONCILE_ENABLED, got {}, expected false", config.reconcile_enabled);
    assert!(
        config.reconcile_interval_seconds == 600,
        "unexpected value parsed for RECONCILE_INTERVAL_SECONDS, got {}, expected {}",
        config.reconcile_interval_seconds,
        "600",
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env_with_defaults() -> Result<()> {
    let config: Config = envy::from_iter(vec![("REDIS_URL".into(), "redis://localhost:6379".into())])?;
    let config = config.validated()?;

    assert!(config.log_level == "info", "unexpected default for LOG_LEVEL, got {}", config.log_level);
    assert!(config.http_port == 8443, "unexpected default for HTTP_PORT, got {}", config.http_port);
    assert!(
        config.spot_preference == SpotPreference::BestEffort,
        "unexpected default for SPOT_PREFERENCE, got {:?}",
        config.spot_preference,
    );
    assert!((config.default_spot_ratio - 0.5).abs() < f64::EPSILON, "unexpected default for DEFAULT_SPOT_RATIO, got {}", config.default_spot_ratio);
    assert!(config.webhook_timeout_seconds == 5, "unexpected default for WEBHOOK_TIMEOUT_SECONDS, got {}", config.webhook_timeout_seconds);
    assert!(config.redis_default_ttl_seconds == 86400, "unexpected default for REDIS_DEFAULT_TTL_SECONDS, got {}", config.redis_default_ttl_seconds);
    assert!(
        config.capacity_type_label == "karpenter.sh/capacity-type",
        "unexpected default for CAPACITY_TYPE_LABEL, got {}",
        config.capacity_type_label,
    );
    assert!(config.workload_role_label == "spark-role", "unexpected default for WORKLOAD_ROLE_LABEL, got {}", config.workload_role_label);
    assert!(config.driver_role_value == "driver", "unexpected default for DRIVER_ROLE_VALUE, got {}", config.driver_role_value);
    assert!(config.executor_role_value == "executor", "unexpected default for EXECUTOR_ROLE_VALUE, got {}", config.executor_role_value);
    assert!(
        config.job_id_label == "emr-containers.amazonaws.com/job.id",
        "unexpected default for JOB_ID_LABEL, got {}",
        config.job_id_label,
    );
    assert!(
        config.spot_ratio_annotation == "workload/spot-ratio",
        "unexpected default for SPOT_RATIO_ANNOTATION, got {}",
        config.spot_ratio_annotation,
    );
    assert!(config.reconcile_enabled, "unexpected default for RECONCILE_ENABLED, got false");
    assert!(
        config.reconcile_interval_seconds == 1800,
        "unexpected default for RECONCILE_INTERVAL_SECONDS, got {}",
        config.reconcile_interval_seconds,
    );

    Ok(())
}

#[test]
fn config_requires_redis_url() {
    let res = envy::from_iter::<_, Config>(vec![("SPOT_PREFERENCE".to_string(), "STRICT".to_string())]);
    assert!(res.is_err(), "expected missing REDIS_URL to fail deserialization");

    let res = envy::from_iter::<_, Config>(vec![("REDIS_URL".to_string(), "".to_string())]).map(Config::validated);
    assert!(matches!(res, Ok(Err(_))), "expected empty REDIS_URL to fail validation");
}

#[test]
fn config_validation_applies_bounds() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
        ("DEFAULT_SPOT_RATIO".to_string(), "1.8".to_string()),
        ("REDIS_DEFAULT_TTL_SECONDS".to_string(), "0".to_string()),
        ("RECONCILE_INTERVAL_SECONDS".to_string(), "5".to_string()),
    ])?;
    let config = config.validated()?;

    assert!((config.default_spot_ratio - 1.0).abs() < f64::EPSILON, "expected ratio clamped to 1.0, got {}", config.default_spot_ratio);
    assert!(config.redis_default_ttl_seconds == 1, "expected TTL floored at 1, got {}", config.redis_default_ttl_seconds);
    assert!(config.reconcile_interval_seconds == 60, "expected interval floored at 60, got {}", config.reconcile_interval_seconds);

    Ok(())
}

#[test]
fn config_rejects_unknown_spot_preference() {
    let res = envy::from_iter::<_, Config>(vec![
        ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
        ("SPOT_PREFERENCE".to_string(), "EVENTUALLY".to_string()),
    ]);
    assert!(res.is_err(), "expected unknown SPOT_PREFERENCE value to fail deserialization");
}
