// gps2bq-config - Layered runtime configuration
//
// Sources, by priority:
// 1. Environment variables (GPS2BQ_*, highest)
// 2. Config file path from GPS2BQ_CONFIG env var
// 3. Default config file locations (./config.toml, ./.gps2bq.toml)
// 4. Built-in defaults (lowest)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod sources;
mod validation;

/// Main runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

/// Redis source: list keys, the distributed lock and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub gps_key: String,
    pub mobile_key: String,
    pub lock_key: String,
    pub lock_ttl_ms: u64,
    pub command_timeout_ms: u64,
    /// Server-side script drain. When false the drainer falls back to
    /// the RENAME-based realization.
    pub atomic_enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            gps_key: "gps:history:global".to_string(),
            mobile_key: "mobile:history:global".to_string(),
            lock_key: "gps2bq:pipeline:lock".to_string(),
            lock_ttl_ms: 60_000,
            command_timeout_ms: 5_000,
            atomic_enabled: true,
        }
    }
}

impl RedisConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingBackend {
    Gcs,
    Fs,
    Memory,
}

impl std::fmt::Display for StagingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingBackend::Gcs => write!(f, "gcs"),
            StagingBackend::Fs => write!(f, "fs"),
            StagingBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StagingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gcs" => Ok(StagingBackend::Gcs),
            "fs" | "filesystem" => Ok(StagingBackend::Fs),
            "memory" | "mem" => Ok(StagingBackend::Memory),
            _ => anyhow::bail!("Unsupported staging backend: {}. Supported: gcs, fs, memory", s),
        }
    }
}

/// Object-store staging area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub backend: StagingBackend,
    pub bucket: String,
    pub gps_prefix: String,
    pub mobile_prefix: String,
    /// Root directory for the fs backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<String>,
    pub upload_timeout_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            backend: StagingBackend::Fs,
            bucket: "gps2bq-staging".to_string(),
            gps_prefix: "gps-data".to_string(),
            mobile_prefix: "mobile-data".to_string(),
            fs_root: Some("./staging".to_string()),
            upload_timeout_secs: 300,
        }
    }
}

impl StagingConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Warehouse sink: dataset, tables and load-job polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub project: String,
    pub dataset: String,
    pub gps_table: String,
    pub mobile_table: String,
    /// API endpoint override, mainly for emulators and tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            dataset: "location_telemetry".to_string(),
            gps_table: "gps_records".to_string(),
            mobile_table: "mobile_records".to_string(),
            endpoint: None,
            poll_interval_ms: 2_000,
            poll_timeout_secs: 600,
        }
    }
}

impl WarehouseConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Durable local backup spool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    pub dir: String,
    pub max_retries: u32,
    pub retention_hours: u64,
    pub base_delay_ms: u64,
    /// Pending-entry count above which the pipeline diverts to
    /// drain-and-spool-only mode.
    pub high_water: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: "./spool".to_string(),
            max_retries: 3,
            retention_hours: 24,
            base_delay_ms: 5_000,
            high_water: 50,
        }
    }
}

impl SpoolConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

/// Cycle cadence and flow selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub interval_secs: u64,
    /// Delete staged objects after a confirmed load.
    pub cleanup_processed: bool,
    /// Staged objects younger than this are skipped by the recovery
    /// sweeper to avoid racing in-flight cycles.
    pub min_orphan_age_secs: u64,
    pub phase: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            cleanup_processed: true,
            min_orphan_age_secs: 300,
            phase: "new".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_orphan_age(&self) -> Duration {
        Duration::from_secs(self.min_orphan_age_secs)
    }
}

/// Hybrid-controller rollback thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub perf_ratio: f64,
    pub cooldown_secs: u64,
    /// Sliding window length, in executions.
    pub window: usize,
    /// Allowed |records_new - records_legacy| in comparison cycles.
    pub record_tolerance: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 3,
            error_rate: 0.1,
            perf_ratio: 2.0,
            cooldown_secs: 900,
            window: 100,
            record_tolerance: 0,
        }
    }
}

impl RollbackConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Ledger snapshot persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub snapshot_path: String,
    pub snapshot_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "./spool/ledger.json".to_string(),
            snapshot_interval_secs: 60,
        }
    }
}

impl MetricsConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority.
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load from an explicit file path, then apply env overrides.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        sources::load_config_from_path(path)
    }

    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
