// In-memory fakes and wiring shared by the integration tests.
//
// Each test binary compiles its own copy, so not every helper is used
// everywhere.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use gps2bq_config::{RollbackConfig, StagingBackend, StagingConfig};
use gps2bq_core::{
    DrainResult, InsertResult, LeaseGuard, LeaseLock, LoadClient, LoadError, LoadRequest,
    LoadResult, ProcessingId, QueueSource, SourceError, StreamType,
};
use gps2bq_pipeline::{
    HybridController, Ledger, LegacyFlow, LogAlertSink, Phase, Pipeline, PipelineSettings,
    RecoverySettings, RecoverySweeper, StagePort,
};
use gps2bq_spool::SpoolStore;
use gps2bq_storage::{
    build_operator, BatchSource, StagedObject, StagingStore, StorageError, UploadOutcome,
};
use gps2bq_warehouse::MemoryLoadClient;

/// In-memory stand-in for the Redis lists. Take-and-clear is atomic
/// under the mutex, exactly like the server-side script.
#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<StreamType, Vec<String>>>,
    failing: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stream: StreamType, raw: impl Into<String>) {
        self.lists
            .lock()
            .entry(stream)
            .or_default()
            .push(raw.into());
    }

    pub fn len(&self, stream: StreamType) -> usize {
        self.lists
            .lock()
            .get(&stream)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueSource for MemoryQueue {
    async fn drain(&self, stream: StreamType) -> Result<DrainResult, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("scripted redis outage".into()));
        }
        let records = self
            .lists
            .lock()
            .get_mut(&stream)
            .map(std::mem::take)
            .unwrap_or_default();
        Ok(DrainResult {
            cleared: !records.is_empty(),
            residual: 0,
            records,
        })
    }

    async fn depth(&self, stream: StreamType) -> Result<usize, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("scripted redis outage".into()));
        }
        Ok(self.len(stream))
    }
}

/// Process-wide fake of the distributed lock.
#[derive(Default)]
pub struct MemoryLock {
    contended: AtomicBool,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_contended(&self, contended: bool) {
        self.contended.store(contended, Ordering::SeqCst);
    }
}

pub struct MemoryGuard {
    held: AtomicBool,
}

#[async_trait]
impl LeaseGuard for MemoryGuard {
    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(self: Box<Self>) {
        self.held.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    async fn acquire(&self) -> Result<Option<Box<dyn LeaseGuard>>, SourceError> {
        if self.contended.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryGuard {
            held: AtomicBool::new(true),
        })))
    }
}

/// Staging wrapper with scripted upload failures.
pub struct FlakyStage {
    inner: StagingStore,
    fail_uploads: Mutex<Vec<StorageError>>,
}

impl FlakyStage {
    pub fn new(inner: StagingStore) -> Self {
        Self {
            inner,
            fail_uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_upload(&self, error: StorageError) {
        self.fail_uploads.lock().push(error);
    }
}

#[async_trait]
impl StagePort for FlakyStage {
    async fn upload(
        &self,
        stream: StreamType,
        processing_id: &ProcessingId,
        extracted_at: DateTime<Utc>,
        records: &[Value],
        source: BatchSource,
        backup_id: Option<String>,
    ) -> Result<UploadOutcome, StorageError> {
        let scripted = {
            let mut fails = self.fail_uploads.lock();
            if fails.is_empty() {
                None
            } else {
                Some(fails.remove(0))
            }
        };
        if let Some(error) = scripted {
            return Err(error);
        }
        self.inner
            .upload(stream, processing_id, extracted_at, records, source, backup_id)
            .await
    }

    async fn list(&self, stream: StreamType) -> Result<Vec<StagedObject>, StorageError> {
        self.inner.list(stream).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    fn source_uri(&self, key: &str) -> String {
        self.inner.source_uri(key)
    }
}

/// Load client that sleeps before delegating; used to hold a cycle open
/// across a concurrent producer push.
pub struct DelayedLoader {
    inner: Arc<MemoryLoadClient>,
    delay: Mutex<Duration>,
}

impl DelayedLoader {
    pub fn new(inner: Arc<MemoryLoadClient>, delay: Duration) -> Self {
        Self {
            inner,
            delay: Mutex::new(delay),
        }
    }
}

#[async_trait]
impl LoadClient for DelayedLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResult, LoadError> {
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;
        self.inner.load(request).await
    }

    async fn insert_rows(
        &self,
        stream: StreamType,
        rows: &[Value],
    ) -> Result<InsertResult, LoadError> {
        self.inner.insert_rows(stream, rows).await
    }
}

fn memory_staging() -> StagingStore {
    let config = StagingConfig {
        backend: StagingBackend::Memory,
        ..Default::default()
    };
    let operator = build_operator(&config).expect("memory operator");
    StagingStore::new(operator, &config)
}

pub struct TestContext {
    pub queue: Arc<MemoryQueue>,
    pub lock: Arc<MemoryLock>,
    pub stage: Arc<FlakyStage>,
    pub staging: StagingStore,
    pub loader: Arc<MemoryLoadClient>,
    pub spool: SpoolStore,
    pub ledger: Arc<Ledger>,
    pub pipeline: Arc<Pipeline>,
    pub token: CancellationToken,
    pub tmp: tempfile::TempDir,
}

pub struct ContextOptions {
    pub cleanup_processed: bool,
    pub base_delay: Duration,
    pub high_water: usize,
    pub load_delay: Option<Duration>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            cleanup_processed: false,
            base_delay: Duration::ZERO,
            high_water: 50,
            load_delay: None,
        }
    }
}

pub async fn context() -> TestContext {
    context_with(ContextOptions::default()).await
}

pub async fn context_with(options: ContextOptions) -> TestContext {
    let tmp = tempfile::tempdir().expect("spool tempdir");
    let queue = Arc::new(MemoryQueue::new());
    let lock = Arc::new(MemoryLock::new());
    let staging = memory_staging();
    let stage = Arc::new(FlakyStage::new(staging.clone()));
    let loader = Arc::new(MemoryLoadClient::new());
    let spool = SpoolStore::open(tmp.path().join("spool"), 3)
        .await
        .expect("spool open");
    let ledger = Arc::new(Ledger::new(tmp.path().join("ledger.json")));
    let alerts = Arc::new(LogAlertSink);

    let warehouse: Arc<dyn LoadClient> = match options.load_delay {
        Some(delay) => Arc::new(DelayedLoader::new(Arc::clone(&loader), delay)),
        None => loader.clone(),
    };

    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        lock.clone(),
        stage.clone(),
        warehouse,
        spool.clone(),
        Arc::clone(&ledger),
        alerts,
        PipelineSettings {
            cleanup_processed: options.cleanup_processed,
            base_delay: options.base_delay,
            high_water: options.high_water,
            name: "new",
        },
    ));

    TestContext {
        queue,
        lock,
        stage,
        staging,
        loader,
        spool,
        ledger,
        pipeline,
        token: CancellationToken::new(),
        tmp,
    }
}

impl TestContext {
    /// Controller over this context's components plus scratch
    /// destinations; the legacy flow shares the real load client.
    pub async fn controller(&self, rollback: RollbackConfig, phase: Phase) -> ControllerContext {
        let scratch_staging = memory_staging();
        let scratch_loader = Arc::new(MemoryLoadClient::new());
        let scratch_spool_dir = self.tmp.path().join("scratch");
        let scratch_spool = SpoolStore::open(&scratch_spool_dir, 3)
            .await
            .expect("scratch spool open");
        let scratch_ledger = Arc::new(Ledger::new(scratch_spool_dir.join("ledger.json")));

        let scratch = Arc::new(Pipeline::new(
            self.queue.clone(),
            self.lock.clone(),
            Arc::new(scratch_staging),
            scratch_loader.clone(),
            scratch_spool,
            scratch_ledger,
            Arc::new(LogAlertSink),
            PipelineSettings {
                cleanup_processed: false,
                base_delay: Duration::ZERO,
                high_water: 50,
                name: "scratch",
            },
        ));

        let legacy = LegacyFlow::new(
            self.loader.clone(),
            self.spool.clone(),
            Arc::clone(&self.ledger),
            Arc::new(LogAlertSink),
            Duration::ZERO,
        );

        let sweeper = RecoverySweeper::new(
            self.stage.clone(),
            self.loader.clone(),
            self.spool.clone(),
            Arc::clone(&self.ledger),
            RecoverySettings {
                min_orphan_age: Duration::ZERO,
                cleanup_processed: true,
                retention: Duration::from_secs(24 * 3600),
            },
        );

        let controller = Arc::new(HybridController::new(
            self.pipeline.clone(),
            Some(scratch),
            legacy,
            sweeper,
            self.queue.clone(),
            self.lock.clone(),
            Arc::clone(&self.ledger),
            Arc::new(LogAlertSink),
            rollback,
            phase,
        ));

        ControllerContext {
            controller,
            scratch_loader,
        }
    }

    pub fn sweeper(&self, min_orphan_age: Duration, cleanup: bool) -> RecoverySweeper {
        RecoverySweeper::new(
            self.stage.clone(),
            self.loader.clone(),
            self.spool.clone(),
            Arc::clone(&self.ledger),
            RecoverySettings {
                min_orphan_age,
                cleanup_processed: cleanup,
                retention: Duration::from_secs(24 * 3600),
            },
        )
    }
}

pub struct ControllerContext {
    pub controller: Arc<HybridController>,
    pub scratch_loader: Arc<MemoryLoadClient>,
}

/// Test fixtures.
pub fn gps_raw(device: &str, lat: f64, lng: f64) -> String {
    format!(
        r#"{{"deviceId":"{}","lat":{},"lng":{},"timestamp":1700000000000}}"#,
        device, lat, lng
    )
}

pub fn mobile_raw(user: &str) -> String {
    format!(
        r#"{{"userId":"{}","name":"Ana","email":"ana@example.com","deviceId":"ph-1","lat":-12.05,"lng":-77.05,"timestamp":1700000000000}}"#,
        user
    )
}
