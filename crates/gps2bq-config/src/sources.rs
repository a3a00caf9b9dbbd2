// Configuration source loading.
//
// Priority: GPS2BQ_* env vars > GPS2BQ_CONFIG file > default file
// locations > built-in defaults.

use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const ENV_PREFIX: &str = "GPS2BQ_";

/// Load configuration from all sources.
pub fn load_config() -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    if let Some(file_config) = load_from_file()? {
        config = file_config;
    }

    apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(config)
}

/// Load from an explicit path, then env overrides on top.
pub fn load_config_from_path(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(config)
}

fn load_from_file() -> Result<Option<RuntimeConfig>> {
    if let Ok(path) = env::var("GPS2BQ_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        return Ok(Some(config));
    }

    for path in &["./config.toml", "./.gps2bq.toml"] {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config: RuntimeConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok(Some(config));
        }
    }

    Ok(None)
}

/// Apply environment variable overrides (highest priority).
fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    // Redis
    if let Some(url) = get_env_string("REDIS_URL")? {
        config.redis.url = url;
    }
    if let Some(key) = get_env_string("GPS_KEY")? {
        config.redis.gps_key = key;
    }
    if let Some(key) = get_env_string("MOBILE_KEY")? {
        config.redis.mobile_key = key;
    }
    if let Some(key) = get_env_string("LOCK_KEY")? {
        config.redis.lock_key = key;
    }
    if let Some(ttl) = get_env_u64("LOCK_TTL_MS")? {
        config.redis.lock_ttl_ms = ttl;
    }
    if let Some(timeout) = get_env_u64("REDIS_TIMEOUT_MS")? {
        config.redis.command_timeout_ms = timeout;
    }
    if let Some(enabled) = get_env_bool("ATOMIC_ENABLED")? {
        config.redis.atomic_enabled = enabled;
    }

    // Staging
    if let Some(backend) = get_env_string("STAGING_BACKEND")? {
        config.staging.backend = backend
            .parse()
            .context("Invalid GPS2BQ_STAGING_BACKEND value")?;
    }
    if let Some(bucket) = get_env_string("STAGING_BUCKET")? {
        config.staging.bucket = bucket;
    }
    if let Some(prefix) = get_env_string("STAGING_GPS_PREFIX")? {
        config.staging.gps_prefix = prefix;
    }
    if let Some(prefix) = get_env_string("STAGING_MOBILE_PREFIX")? {
        config.staging.mobile_prefix = prefix;
    }
    if let Some(root) = get_env_string("STAGING_FS_ROOT")? {
        config.staging.fs_root = Some(root);
    }
    if let Some(secs) = get_env_u64("STAGING_UPLOAD_TIMEOUT_SECS")? {
        config.staging.upload_timeout_secs = secs;
    }

    // Warehouse
    if let Some(project) = get_env_string("WAREHOUSE_PROJECT")? {
        config.warehouse.project = project;
    }
    if let Some(dataset) = get_env_string("WAREHOUSE_DATASET")? {
        config.warehouse.dataset = dataset;
    }
    if let Some(table) = get_env_string("WAREHOUSE_GPS_TABLE")? {
        config.warehouse.gps_table = table;
    }
    if let Some(table) = get_env_string("WAREHOUSE_MOBILE_TABLE")? {
        config.warehouse.mobile_table = table;
    }
    if let Some(endpoint) = get_env_string("WAREHOUSE_ENDPOINT")? {
        config.warehouse.endpoint = Some(endpoint);
    }

    // Spool
    if let Some(dir) = get_env_string("SPOOL_DIR")? {
        config.spool.dir = dir;
    }
    if let Some(retries) = get_env_u64("SPOOL_MAX_RETRIES")? {
        config.spool.max_retries = retries as u32;
    }
    if let Some(hours) = get_env_u64("SPOOL_RETENTION_HOURS")? {
        config.spool.retention_hours = hours;
    }
    if let Some(delay) = get_env_u64("SPOOL_BASE_DELAY_MS")? {
        config.spool.base_delay_ms = delay;
    }
    if let Some(hw) = get_env_u64("SPOOL_HIGH_WATER")? {
        config.spool.high_water = hw as usize;
    }

    // Pipeline
    if let Some(secs) = get_env_u64("INTERVAL_SECS")? {
        config.pipeline.interval_secs = secs;
    }
    if let Some(cleanup) = get_env_bool("CLEANUP_PROCESSED")? {
        config.pipeline.cleanup_processed = cleanup;
    }
    if let Some(phase) = get_env_string("PHASE")? {
        config.pipeline.phase = phase;
    }

    // Rollback
    if let Some(n) = get_env_u64("ROLLBACK_CONSECUTIVE")? {
        config.rollback.consecutive_failures = n as u32;
    }
    if let Some(rate) = get_env_f64("ROLLBACK_ERROR_RATE")? {
        config.rollback.error_rate = rate;
    }
    if let Some(ratio) = get_env_f64("ROLLBACK_PERF_RATIO")? {
        config.rollback.perf_ratio = ratio;
    }
    if let Some(secs) = get_env_u64("ROLLBACK_COOLDOWN_SECS")? {
        config.rollback.cooldown_secs = secs;
    }

    // Metrics
    if let Some(path) = get_env_string("METRICS_SNAPSHOT_PATH")? {
        config.metrics.snapshot_path = path;
    }

    // Server
    if let Some(addr) = get_env_string("LISTEN_ADDR")? {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = addr;
    }
    if let Some(level) = get_env_string("LOG_LEVEL")? {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level;
    }
    if let Some(format) = get_env_string("LOG_FORMAT")? {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read env var {}", full_key)),
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_f64(key: &str) -> Result<Option<f64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<f64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool(key: &str) -> Result<Option<bool>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => anyhow::bail!("{} must be true or false", full_key),
            };
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[redis]
url = "redis://redis.internal:6379"
gps_key = "gps:history:global"
mobile_key = "mobile:history:global"
lock_key = "gps2bq:pipeline:lock"
lock_ttl_ms = 90000
command_timeout_ms = 5000
atomic_enabled = false

[spool]
dir = "/var/lib/gps2bq/spool"
max_retries = 5
retention_hours = 48
base_delay_ms = 1000
high_water = 10
"#
        )
        .unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.redis.url, "redis://redis.internal:6379");
        assert_eq!(config.redis.lock_ttl_ms, 90_000);
        assert!(!config.redis.atomic_enabled);
        assert_eq!(config.spool.max_retries, 5);
        // Sections absent from the file keep their defaults.
        assert_eq!(config.warehouse.gps_table, "gps_records");
    }

    #[test]
    fn test_bool_parsing() {
        std::env::set_var("GPS2BQ_CLEANUP_PROCESSED", "off");
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config).unwrap();
        assert!(!config.pipeline.cleanup_processed);
        std::env::remove_var("GPS2BQ_CLEANUP_PROCESSED");
    }
}
