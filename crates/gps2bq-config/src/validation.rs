// Configuration validation.

use crate::{RuntimeConfig, StagingBackend};
use anyhow::{bail, Result};

const PHASES: &[&str] = &["legacy", "hybrid", "migration", "new"];

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    if config.redis.url.is_empty() {
        bail!("redis.url must not be empty");
    }
    if config.redis.lock_ttl_ms <= config.redis.command_timeout_ms {
        bail!(
            "redis.lock_ttl_ms ({}) must exceed redis.command_timeout_ms ({})",
            config.redis.lock_ttl_ms,
            config.redis.command_timeout_ms
        );
    }

    if config.staging.backend == StagingBackend::Gcs && config.staging.bucket.is_empty() {
        bail!("staging.bucket is required for the gcs backend");
    }
    if config.staging.backend == StagingBackend::Fs
        && config.staging.fs_root.as_deref().unwrap_or("").is_empty()
    {
        bail!("staging.fs_root is required for the fs backend");
    }
    if config.staging.gps_prefix == config.staging.mobile_prefix {
        bail!("staging prefixes must differ per stream");
    }

    if config.spool.dir.is_empty() {
        bail!("spool.dir must not be empty");
    }
    if config.spool.max_retries == 0 {
        bail!("spool.max_retries must be at least 1");
    }

    if !PHASES.contains(&config.pipeline.phase.as_str()) {
        bail!(
            "pipeline.phase must be one of {:?}, got '{}'",
            PHASES,
            config.pipeline.phase
        );
    }

    if config.rollback.error_rate <= 0.0 || config.rollback.error_rate > 1.0 {
        bail!(
            "rollback.error_rate must be in (0, 1], got {}",
            config.rollback.error_rate
        );
    }
    if config.rollback.perf_ratio < 1.0 {
        bail!(
            "rollback.perf_ratio must be >= 1.0, got {}",
            config.rollback.perf_ratio
        );
    }
    if config.rollback.window == 0 {
        bail!("rollback.window must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_lock_ttl_below_command_timeout() {
        let mut config = RuntimeConfig::default();
        config.redis.lock_ttl_ms = 1_000;
        config.redis.command_timeout_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_gcs_without_bucket() {
        let mut config = RuntimeConfig::default();
        config.staging.backend = StagingBackend::Gcs;
        config.staging.bucket = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_phase() {
        let mut config = RuntimeConfig::default();
        config.pipeline.phase = "yolo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_rollback_thresholds() {
        let mut config = RuntimeConfig::default();
        config.rollback.error_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.rollback.perf_ratio = 0.5;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.spool.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
