// Component construction and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use gps2bq_config::{LogFormat, RuntimeConfig, StagingBackend, StagingConfig};
use gps2bq_pipeline::{
    HybridController, Ledger, LegacyFlow, LogAlertSink, Phase, Pipeline, PipelineSettings,
    RecoverySettings, RecoverySweeper,
};
use gps2bq_redis::{RedisLock, RedisQueue};
use gps2bq_spool::SpoolStore;
use gps2bq_storage::{build_operator, StagingStore};
use gps2bq_warehouse::{BigQueryClient, MemoryLoadClient, NoAuth, StaticToken, TokenProvider};

const TOKEN_ENV: &str = "GPS2BQ_WAREHOUSE_TOKEN";

/// Initialize tracing based on config.
pub fn init_tracing(config: &RuntimeConfig) {
    let server = config.server.clone().unwrap_or_default();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(server.log_level.clone()));

    match server.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Wire every component the controller needs.
pub async fn build_controller(config: &RuntimeConfig) -> Result<Arc<HybridController>> {
    // Source
    let queue = Arc::new(
        RedisQueue::connect(&config.redis)
            .await
            .context("Failed to connect to Redis")?,
    );
    let lock = Arc::new(RedisLock::with_connection(
        queue.connection(),
        &config.redis,
    ));

    // Staging
    let operator = build_operator(&config.staging).context("Failed to build staging operator")?;
    let staging = StagingStore::new(operator, &config.staging);
    info!(
        backend = %config.staging.backend,
        bucket = %config.staging.bucket,
        "staging store ready"
    );

    // Warehouse
    let token_provider: Arc<dyn TokenProvider> = match StaticToken::from_env(TOKEN_ENV) {
        Some(token) => Arc::new(token),
        None => Arc::new(NoAuth),
    };
    let warehouse = Arc::new(BigQueryClient::new(&config.warehouse, token_provider));

    // Spool + ledger + alerts
    let spool = SpoolStore::open(&config.spool.dir, config.spool.max_retries)
        .await
        .context("Failed to open spool directory")?;
    let ledger = Arc::new(Ledger::new(&config.metrics.snapshot_path));
    ledger.load_persisted().await;
    let alerts = Arc::new(LogAlertSink);

    let settings = PipelineSettings {
        cleanup_processed: config.pipeline.cleanup_processed,
        base_delay: config.spool.base_delay(),
        high_water: config.spool.high_water,
        name: "new",
    };

    let new_flow = Arc::new(Pipeline::new(
        queue.clone(),
        lock.clone(),
        Arc::new(staging.clone()),
        warehouse.clone(),
        spool.clone(),
        Arc::clone(&ledger),
        alerts.clone(),
        settings.clone(),
    ));

    // Scratch destinations for hybrid comparison cycles: memory
    // staging, memory loader, a scratch spool subdirectory and a ledger
    // of its own so dry-runs never pollute the real statistics.
    let scratch_flow = build_scratch_flow(config, &queue, &lock, &alerts, &settings)
        .await
        .context("Failed to build scratch flow")?;

    let legacy = LegacyFlow::new(
        warehouse.clone(),
        spool.clone(),
        Arc::clone(&ledger),
        alerts.clone(),
        config.spool.base_delay(),
    );

    let sweeper = RecoverySweeper::new(
        Arc::new(staging),
        warehouse.clone(),
        spool.clone(),
        Arc::clone(&ledger),
        RecoverySettings {
            min_orphan_age: config.pipeline.min_orphan_age(),
            cleanup_processed: config.pipeline.cleanup_processed,
            retention: config.spool.retention(),
        },
    );

    let phase: Phase = config
        .pipeline
        .phase
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    Ok(Arc::new(HybridController::new(
        new_flow,
        Some(scratch_flow),
        legacy,
        sweeper,
        queue,
        lock,
        ledger,
        alerts,
        config.rollback.clone(),
        phase,
    )))
}

async fn build_scratch_flow(
    config: &RuntimeConfig,
    queue: &Arc<RedisQueue>,
    lock: &Arc<RedisLock>,
    alerts: &Arc<LogAlertSink>,
    settings: &PipelineSettings,
) -> Result<Arc<Pipeline>> {
    let scratch_staging_config = StagingConfig {
        backend: StagingBackend::Memory,
        ..config.staging.clone()
    };
    let scratch_operator = build_operator(&scratch_staging_config)?;
    let scratch_staging = StagingStore::new(scratch_operator, &scratch_staging_config);

    let scratch_dir = PathBuf::from(&config.spool.dir).join("scratch");
    let scratch_spool = SpoolStore::open(&scratch_dir, config.spool.max_retries).await?;

    let scratch_ledger = Arc::new(Ledger::new(scratch_dir.join("ledger.json")));
    let scratch_loader = Arc::new(MemoryLoadClient::new());

    Ok(Arc::new(Pipeline::new(
        queue.clone(),
        lock.clone(),
        Arc::new(scratch_staging),
        scratch_loader,
        scratch_spool,
        scratch_ledger,
        alerts.clone(),
        PipelineSettings {
            name: "scratch",
            ..settings.clone()
        },
    )))
}
