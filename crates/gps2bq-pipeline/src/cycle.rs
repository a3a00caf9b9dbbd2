// The pipeline stage machine.
//
// One cycle: acquire the distributed lock, drain both Redis lists
// atomically, replay due spool entries, then per stream validate,
// stage to the object store and load into the warehouse. A staging
// failure diverts the batch into the spool; a load failure leaves the
// staged object for the recovery sweeper. The cancellation token and
// the lease are checked before every state-mutating step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gps2bq_core::separate::separate;
use gps2bq_core::{
    AlertEvent, AlertKind, AlertSink, Batch, CycleOutcome, DrainAllResult, DrainSummary,
    ErrorKind, LeaseGuard, LeaseLock, LoadClient, LoadRequest, QueueSource, ReplayOutcome,
    StageMarker, StreamType, TypeOutcome,
};
use gps2bq_spool::{SpoolError, SpoolStore};
use gps2bq_storage::BatchSource;
use gps2bq_warehouse::job_id_for_key;

use crate::ledger::Ledger;
use crate::ports::StagePort;

/// Knobs the stage machine needs from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Delete staged objects after a confirmed load.
    pub cleanup_processed: bool,
    /// Spool retry backoff base.
    pub base_delay: std::time::Duration,
    /// Pending-entry count that flips the cycle into
    /// drain-and-spool-only mode.
    pub high_water: usize,
    /// Shown in logs; the hybrid controller's scratch instance runs as
    /// "scratch".
    pub name: &'static str,
}

/// One stream's share of a drained cycle: the immutable raw batch plus
/// the validated records routed to this stream (including strays that
/// arrived on the other list).
pub struct TypedBatch {
    pub batch: Batch,
    pub records: Vec<Value>,
    pub rejected: usize,
}

/// Split both drained lists record-wise and regroup by shape.
pub fn assemble_typed_batches(drained: &DrainAllResult) -> Vec<TypedBatch> {
    let now = Utc::now();
    let mut gps_records: Vec<Value> = Vec::new();
    let mut mobile_records: Vec<Value> = Vec::new();
    let mut rejected = [0usize; 2];
    let mut batches = Vec::new();

    for (i, stream) in StreamType::ALL.into_iter().enumerate() {
        let raw = drained
            .stream(stream)
            .map(|r| r.records.clone())
            .unwrap_or_default();
        let separated = separate(&raw, now);
        rejected[i] = separated.invalid.len();
        gps_records.extend(
            separated
                .gps
                .into_iter()
                .filter_map(|r| serde_json::to_value(r).ok()),
        );
        mobile_records.extend(
            separated
                .mobile
                .into_iter()
                .filter_map(|r| serde_json::to_value(r).ok()),
        );
        batches.push(Batch::new(stream, raw, now));
    }

    let mut out = Vec::new();
    for (i, batch) in batches.into_iter().enumerate() {
        let records = match batch.stream {
            StreamType::Gps => std::mem::take(&mut gps_records),
            StreamType::Mobile => std::mem::take(&mut mobile_records),
        };
        out.push(TypedBatch {
            batch,
            records,
            rejected: rejected[i],
        });
    }
    out
}

/// The stage machine. One per destination set; the hybrid controller
/// runs a second instance against scratch destinations.
pub struct Pipeline {
    source: Arc<dyn QueueSource>,
    lock: Arc<dyn LeaseLock>,
    staging: Arc<dyn StagePort>,
    warehouse: Arc<dyn LoadClient>,
    spool: SpoolStore,
    ledger: Arc<Ledger>,
    alerts: Arc<dyn AlertSink>,
    settings: PipelineSettings,
    /// Process-local guard: at most one cycle active per process.
    cycle_active: AtomicBool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn QueueSource>,
        lock: Arc<dyn LeaseLock>,
        staging: Arc<dyn StagePort>,
        warehouse: Arc<dyn LoadClient>,
        spool: SpoolStore,
        ledger: Arc<Ledger>,
        alerts: Arc<dyn AlertSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            lock,
            staging,
            warehouse,
            spool,
            ledger,
            alerts,
            settings,
            cycle_active: AtomicBool::new(false),
        }
    }

    pub fn spool(&self) -> &SpoolStore {
        &self.spool
    }

    pub fn staging(&self) -> &Arc<dyn StagePort> {
        &self.staging
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn source(&self) -> &Arc<dyn QueueSource> {
        &self.source
    }

    pub fn lock(&self) -> &Arc<dyn LeaseLock> {
        &self.lock
    }

    pub fn warehouse(&self) -> &Arc<dyn LoadClient> {
        &self.warehouse
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one full cycle: lock, drain, process, release.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleOutcome {
        let started_at = Utc::now();

        if self.cycle_active.swap(true, Ordering::SeqCst) {
            let outcome = CycleOutcome::skipped("busy", started_at);
            self.ledger.record_cycle(&outcome);
            return outcome;
        }
        let _active = ActiveFlag(&self.cycle_active);

        let guard = match self.lock.acquire().await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(pipeline = self.settings.name, "lock held elsewhere; skipping cycle");
                let outcome = CycleOutcome::skipped("busy", started_at);
                self.ledger.record_cycle(&outcome);
                return outcome;
            }
            Err(e) => {
                let outcome = CycleOutcome::skipped(e.kind().as_str(), started_at);
                self.ledger.record_cycle(&outcome);
                return outcome;
            }
        };

        // The drain is the first state mutation; honor a cancellation
        // that arrived while we were acquiring the lock.
        if token.is_cancelled() {
            guard.release().await;
            let outcome = CycleOutcome::skipped("cancelled", started_at);
            self.ledger.record_cycle(&outcome);
            return outcome;
        }

        let drained = self.source.drain_all().await;
        let outcome = self
            .process_drained(token, Some(guard.as_ref()), &drained)
            .await;

        guard.release().await;
        self.ledger.record_cycle(&outcome);
        outcome
    }

    /// Process an already-drained result. Used by `run_cycle` and, with
    /// the lock held at the controller, by the hybrid flows.
    pub async fn process_drained(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
        drained: &DrainAllResult,
    ) -> CycleOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();

        // A drain failure with nothing captured aborts without state
        // change; a partial drain already cleared Redis for one stream,
        // so those records must be processed regardless.
        if !drained.success && drained.total_records() == 0 {
            let kind = drained
                .error
                .as_ref()
                .map(|e| e.kind())
                .unwrap_or(ErrorKind::RedisUnavailable);
            let mut outcome = CycleOutcome::skipped(kind.as_str(), started_at);
            outcome.extraction = Some(DrainSummary::from(drained));
            return outcome;
        }

        let pending = match self.spool.pending_batches().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "spool scan failed at cycle start");
                Vec::new()
            }
        };

        let total_drained = drained.total_records();
        if total_drained == 0 && pending.is_empty() {
            return CycleOutcome {
                success: true,
                reason: None,
                total_records: 0,
                extraction: Some(DrainSummary::from(drained)),
                replayed: Vec::new(),
                per_type: Vec::new(),
                processing_ms: timer.elapsed().as_millis() as u64,
                started_at,
            };
        }

        // Spool replay precedes new drains: this bounds the spool size
        // under sustained staging failures.
        let replayed = self.replay_spool(token, lease, pending).await;

        let backpressure = match self.spool.pending_count().await {
            Ok(count) => count > self.settings.high_water,
            Err(_) => false,
        };
        if backpressure {
            self.raise_alert(AlertEvent::new(
                AlertKind::SpoolHighWater,
                format!(
                    "spool pending depth exceeds high water mark {}; diverting to spool only",
                    self.settings.high_water
                ),
            ));
        }

        let mut per_type = Vec::new();
        for typed in assemble_typed_batches(drained) {
            if let Some(reason) = interrupted(token, lease) {
                let mut out = TypeOutcome::new(typed.batch.stream);
                out.error = Some(reason.to_string());
                out.error_kind = Some(ErrorKind::Cancelled);
                per_type.push(out);
                break;
            }
            let out = if backpressure {
                self.divert_to_spool(typed).await
            } else {
                self.process_stream(token, lease, typed).await
            };
            per_type.push(out);
        }

        let success =
            drained.success && per_type.iter().all(|t| t.succeeded()) && replayed.iter().all(|r| r.success);
        let reason = if backpressure {
            Some("backpressure".to_string())
        } else if !drained.success {
            drained.error.as_ref().map(|e| e.kind().as_str().to_string())
        } else {
            None
        };

        CycleOutcome {
            success,
            reason,
            total_records: total_drained,
            extraction: Some(DrainSummary::from(drained)),
            replayed,
            per_type,
            processing_ms: timer.elapsed().as_millis() as u64,
            started_at,
        }
    }

    /// Replay due pending spool entries, oldest first.
    async fn replay_spool(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
        pending: Vec<gps2bq_spool::SpoolEntry>,
    ) -> Vec<ReplayOutcome> {
        let mut outcomes = Vec::new();
        let now = Utc::now();

        for entry in pending {
            if !entry.due(self.settings.base_delay, now) {
                continue;
            }
            if interrupted(token, lease).is_some() {
                break;
            }

            self.ledger.record_retry(Utc::now());
            let taken = match self.spool.mark_processing(&entry.id).await {
                Ok(taken) => taken,
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "could not take spool entry for retry");
                    outcomes.push(ReplayOutcome {
                        spool_id: entry.id.clone(),
                        stream: entry.stream,
                        success: false,
                        staged_key: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            outcomes.push(self.replay_entry(taken).await);
        }
        outcomes
    }

    /// One spool entry: upload under a fresh staged key annotated as
    /// local_backup, then try the load in the same cycle.
    async fn replay_entry(&self, entry: gps2bq_spool::SpoolEntry) -> ReplayOutcome {
        let processing_id =
            gps2bq_core::ProcessingId::generate(entry.stream, Utc::now());

        let uploaded = self
            .staging
            .upload(
                entry.stream,
                &processing_id,
                entry.payload.extracted_at,
                &entry.payload.records,
                BatchSource::LocalBackup,
                Some(entry.id.clone()),
            )
            .await;

        let staged = match uploaded {
            Ok(outcome) => outcome,
            Err(e) => {
                let result = self
                    .spool
                    .mark_attempt_failed(&entry.id, e.kind(), &e.to_string())
                    .await;
                if let Err(SpoolError::BudgetExhausted(_)) = &result {
                    self.raise_alert(
                        AlertEvent::new(
                            AlertKind::SpoolBudgetExhausted,
                            format!("spool entry {} exhausted its retry budget", entry.id),
                        )
                        .for_stream(entry.stream),
                    );
                }
                return ReplayOutcome {
                    spool_id: entry.id,
                    stream: entry.stream,
                    success: false,
                    staged_key: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let key = staged.object().key.clone();
        if let Err(e) = self.spool.mark_completed(&entry.id, None).await {
            warn!(id = %entry.id, error = %e, "could not mark spool entry completed");
        }
        info!(
            id = %entry.id,
            key = %key,
            records = entry.payload.records.len(),
            "replayed spool entry to staging"
        );

        // Same-cycle load attempt. A failure here is not a replay
        // failure: the records are secured in the staged object and the
        // recovery sweeper will finish the job.
        let request = LoadRequest {
            stream: entry.stream,
            source_uri: self.staging.source_uri(&key),
            job_id: job_id_for_key(&key),
            staged_key: key.clone(),
            record_count: entry.payload.records.len(),
        };
        match self.warehouse.load(&request).await {
            Ok(result) => {
                self.ledger.record_load(&key, result.records_loaded);
                if let Err(e) = self.spool.remove(&entry.id).await {
                    warn!(id = %entry.id, error = %e, "could not remove completed spool entry");
                }
                if self.settings.cleanup_processed {
                    if let Err(e) = self.staging.delete(&key).await {
                        warn!(key = %key, error = %e, "cleanup of loaded staged object failed");
                    }
                }
                ReplayOutcome {
                    spool_id: entry.id,
                    stream: entry.stream,
                    success: true,
                    staged_key: Some(key),
                    error: None,
                }
            }
            Err(e) => ReplayOutcome {
                spool_id: entry.id,
                stream: entry.stream,
                success: true,
                staged_key: Some(key),
                error: Some(e.to_string()),
            },
        }
    }

    /// Backpressure mode: validated records go straight to the spool;
    /// no stage or load attempts that could amplify the failure.
    async fn divert_to_spool(&self, typed: TypedBatch) -> TypeOutcome {
        let stream = typed.batch.stream;
        let mut out = TypeOutcome::new(stream);
        out.records_processed = typed.records.len();
        self.ledger.record_rejects(stream, typed.rejected);

        if typed.records.is_empty() {
            return out;
        }

        out.stage = StageMarker::Stage;
        match self
            .spool
            .store(
                stream,
                &typed.batch.processing_id,
                typed.batch.extracted_at,
                typed.records,
            )
            .await
        {
            Ok(entry) => {
                out.spool_id = Some(entry.id);
                out.backup_created = true;
            }
            Err(e) => {
                out.error = Some(e.to_string());
                out.error_kind = Some(e.kind());
            }
        }
        out
    }

    /// extract → stage → load for one stream.
    async fn process_stream(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
        typed: TypedBatch,
    ) -> TypeOutcome {
        let stream = typed.batch.stream;
        let mut out = TypeOutcome::new(stream);
        out.records_processed = typed.records.len();
        self.ledger.record_rejects(stream, typed.rejected);

        // A batch of zero valid records never produces a staged object
        // or a spool entry.
        if typed.records.is_empty() {
            return out;
        }

        if let Some(reason) = interrupted(token, lease) {
            out.error = Some(reason.to_string());
            out.error_kind = Some(ErrorKind::Cancelled);
            return out;
        }

        // Stage
        let staged = self
            .staging
            .upload(
                stream,
                &typed.batch.processing_id,
                typed.batch.extracted_at,
                &typed.records,
                BatchSource::AtomicExtraction,
                None,
            )
            .await;

        let staged = match staged {
            Ok(upload) => {
                if upload.already_existed() {
                    debug!(key = %upload.object().key, "re-stage was a no-op");
                }
                upload
            }
            Err(e) => {
                out.stage = StageMarker::Stage;
                out.error = Some(e.to_string());
                out.error_kind = Some(e.kind());

                match self
                    .spool
                    .store(
                        stream,
                        &typed.batch.processing_id,
                        typed.batch.extracted_at,
                        typed.records,
                    )
                    .await
                {
                    Ok(entry) => {
                        info!(stream = stream.as_str(), spool_id = %entry.id, "staging failed; batch diverted to spool");
                        out.spool_id = Some(entry.id);
                        out.backup_created = true;
                    }
                    Err(spool_err) => {
                        warn!(
                            stream = stream.as_str(),
                            error = %spool_err,
                            "staging AND spool failed; records remain only in this process"
                        );
                    }
                }

                if !e.is_transient() {
                    self.raise_alert(
                        AlertEvent::new(
                            AlertKind::StagePermanent,
                            format!("permanent staging failure on {}: {}", stream, e),
                        )
                        .for_stream(stream),
                    );
                }
                return out;
            }
        };

        out.stage = StageMarker::Stage;
        let key = staged.object().key.clone();
        out.staged_key = Some(key.clone());
        self.ledger.record_bytes_staged(stream, staged.object().size);

        if let Some(reason) = interrupted(token, lease) {
            // The staged object is durable; the sweeper finishes the load.
            out.error = Some(reason.to_string());
            out.error_kind = Some(ErrorKind::Cancelled);
            return out;
        }

        // Load
        out.stage = StageMarker::Load;
        let request = LoadRequest {
            stream,
            source_uri: self.staging.source_uri(&key),
            job_id: job_id_for_key(&key),
            staged_key: key.clone(),
            record_count: typed.records.len(),
        };

        match self.warehouse.load(&request).await {
            Ok(result) => {
                out.records_loaded = result.records_loaded;
                out.stage = StageMarker::Complete;
                self.ledger.record_load(&key, result.records_loaded);
                info!(
                    stream = stream.as_str(),
                    key = %key,
                    records = result.records_loaded,
                    "batch loaded"
                );

                if self.settings.cleanup_processed {
                    if let Err(e) = self.staging.delete(&key).await {
                        warn!(key = %key, error = %e, "cleanup of loaded staged object failed");
                    }
                }
            }
            Err(e) => {
                // Staged object stays put; the recovery sweeper retries.
                out.error = Some(e.to_string());
                out.error_kind = Some(e.kind());
                warn!(stream = stream.as_str(), key = %key, error = %e, "load failed; staged object left for recovery");
            }
        }

        out
    }

    pub(crate) fn raise_alert(&self, event: AlertEvent) {
        self.alerts.alert(event.clone());
        self.ledger.record_alert(event);
    }
}

/// Cancellation and lease checks shared by the mutating steps.
fn interrupted(token: &CancellationToken, lease: Option<&dyn LeaseGuard>) -> Option<&'static str> {
    if token.is_cancelled() {
        return Some("cancelled");
    }
    if let Some(lease) = lease {
        if !lease.is_held() {
            return Some("lease_lost");
        }
    }
    None
}

struct ActiveFlag<'a>(&'a AtomicBool);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gps2bq_core::DrainResult;

    fn drained_with(gps: Vec<&str>, mobile: Vec<&str>) -> DrainAllResult {
        DrainAllResult {
            gps: Some(DrainResult {
                records: gps.into_iter().map(String::from).collect(),
                cleared: true,
                residual: 0,
            }),
            mobile: Some(DrainResult {
                records: mobile.into_iter().map(String::from).collect(),
                cleared: true,
                residual: 0,
            }),
            success: true,
            error: None,
        }
    }

    #[test]
    fn test_assemble_routes_strays_by_shape() {
        // A mobile-shaped record sitting on the GPS list ends up in the
        // mobile pool.
        let stray = r#"{"userId":"u9","name":"Eva","email":"eva@example.com","deviceId":"ph","lat":1.0,"lng":2.0,"timestamp":1700000000000}"#;
        let gps = r#"{"deviceId":"bus","lat":1.0,"lng":2.0,"timestamp":1700000000000}"#;

        let typed = assemble_typed_batches(&drained_with(vec![gps, stray], vec![]));
        assert_eq!(typed.len(), 2);
        assert_eq!(typed[0].batch.stream, StreamType::Gps);
        assert_eq!(typed[0].records.len(), 1);
        assert_eq!(typed[1].batch.stream, StreamType::Mobile);
        assert_eq!(typed[1].records.len(), 1);
        assert_eq!(typed[1].records[0]["userId"], "u9");
    }

    #[test]
    fn test_assemble_counts_rejects_per_source_list(){
        let typed = assemble_typed_batches(&drained_with(vec!["garbage"], vec![]));
        assert_eq!(typed[0].rejected, 1);
        assert_eq!(typed[1].rejected, 0);
        assert!(typed[0].records.is_empty());
    }
}
