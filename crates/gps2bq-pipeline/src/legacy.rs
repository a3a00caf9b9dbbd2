// The legacy direct path: Redis → warehouse streaming inserts.
//
// Kept alive through the cutover. It consumes the same atomic drain as
// the staged path and honors the same no-loss rule: a failed insert
// diverts the batch into the spool, whose entries it also replays by
// direct insert while it is the destructive flow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gps2bq_core::{
    AlertEvent, AlertKind, AlertSink, CycleOutcome, DrainAllResult, DrainSummary, LeaseGuard,
    LoadClient, ReplayOutcome, StageMarker, StreamType, TypeOutcome,
};
use gps2bq_spool::{SpoolError, SpoolStore};

use crate::cycle::{assemble_typed_batches, TypedBatch};
use crate::ledger::Ledger;

pub struct LegacyFlow {
    warehouse: Arc<dyn LoadClient>,
    spool: SpoolStore,
    ledger: Arc<Ledger>,
    alerts: Arc<dyn AlertSink>,
    base_delay: Duration,
}

impl LegacyFlow {
    pub fn new(
        warehouse: Arc<dyn LoadClient>,
        spool: SpoolStore,
        ledger: Arc<Ledger>,
        alerts: Arc<dyn AlertSink>,
        base_delay: Duration,
    ) -> Self {
        Self {
            warehouse,
            spool,
            ledger,
            alerts,
            base_delay,
        }
    }

    /// One legacy cycle over an already-drained batch.
    pub async fn run(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
        drained: &DrainAllResult,
    ) -> CycleOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();

        let replayed = self.replay_spool(token, lease).await;

        let mut per_type = Vec::new();
        for typed in assemble_typed_batches(drained) {
            if cancelled(token, lease) {
                break;
            }
            per_type.push(self.insert_batch(typed).await);
        }

        let success = drained.success
            && per_type.iter().all(|t| t.succeeded())
            && replayed.iter().all(|r| r.success);

        CycleOutcome {
            success,
            reason: drained
                .error
                .as_ref()
                .map(|e| e.kind().as_str().to_string()),
            total_records: drained.total_records(),
            extraction: Some(DrainSummary::from(drained)),
            replayed,
            per_type,
            processing_ms: timer.elapsed().as_millis() as u64,
            started_at,
        }
    }

    /// Fallback for the migration phase: secure only the named streams
    /// out of an already-drained batch.
    pub async fn fallback(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
        drained: &DrainAllResult,
        streams: &[StreamType],
    ) -> Vec<TypeOutcome> {
        let mut out = Vec::new();
        for typed in assemble_typed_batches(drained) {
            if !streams.contains(&typed.batch.stream) {
                continue;
            }
            if cancelled(token, lease) {
                break;
            }
            out.push(self.insert_batch(typed).await);
        }
        out
    }

    async fn insert_batch(&self, typed: TypedBatch) -> TypeOutcome {
        let stream = typed.batch.stream;
        let mut out = TypeOutcome::new(stream);
        out.records_processed = typed.records.len();

        if typed.records.is_empty() {
            return out;
        }

        out.stage = StageMarker::Load;
        match self.warehouse.insert_rows(stream, &typed.records).await {
            Ok(result) => {
                out.records_loaded = result.rows_inserted;
                out.stage = StageMarker::Complete;
                info!(
                    stream = stream.as_str(),
                    rows = result.rows_inserted,
                    "legacy direct insert completed"
                );
            }
            Err(e) => {
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
                        warn!(stream = stream.as_str(), spool_id = %entry.id, "legacy insert failed; batch diverted to spool");
                        out.spool_id = Some(entry.id);
                        out.backup_created = true;
                    }
                    Err(spool_err) => {
                        warn!(stream = stream.as_str(), error = %spool_err, "legacy insert AND spool failed");
                    }
                }
            }
        }
        out
    }

    /// Replay due spool entries by direct insert while legacy is the
    /// destructive flow.
    async fn replay_spool(
        &self,
        token: &CancellationToken,
        lease: Option<&dyn LeaseGuard>,
    ) -> Vec<ReplayOutcome> {
        let pending = match self.spool.pending_batches().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "spool scan failed in legacy flow");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut outcomes = Vec::new();
        for entry in pending {
            if !entry.due(self.base_delay, now) {
                continue;
            }
            if cancelled(token, lease) {
                break;
            }

            self.ledger.record_retry(Utc::now());
            let taken = match self.spool.mark_processing(&entry.id).await {
                Ok(taken) => taken,
                Err(e) => {
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

            match self
                .warehouse
                .insert_rows(taken.stream, &taken.payload.records)
                .await
            {
                Ok(result) => {
                    if let Err(e) = self.spool.mark_completed(&taken.id, None).await {
                        warn!(id = %taken.id, error = %e, "could not mark spool entry completed");
                    }
                    if let Err(e) = self.spool.remove(&taken.id).await {
                        warn!(id = %taken.id, error = %e, "could not remove replayed spool entry");
                    }
                    info!(id = %taken.id, rows = result.rows_inserted, "spool entry replayed by direct insert");
                    outcomes.push(ReplayOutcome {
                        spool_id: taken.id,
                        stream: taken.stream,
                        success: true,
                        staged_key: None,
                        error: None,
                    });
                }
                Err(e) => {
                    let result = self
                        .spool
                        .mark_attempt_failed(&taken.id, e.kind(), &e.to_string())
                        .await;
                    if let Err(SpoolError::BudgetExhausted(_)) = &result {
                        let alert = AlertEvent::new(
                            AlertKind::SpoolBudgetExhausted,
                            format!("spool entry {} exhausted its retry budget", taken.id),
                        )
                        .for_stream(taken.stream);
                        self.alerts.alert(alert.clone());
                        self.ledger.record_alert(alert);
                    }
                    outcomes.push(ReplayOutcome {
                        spool_id: taken.id,
                        stream: taken.stream,
                        success: false,
                        staged_key: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }
}

fn cancelled(token: &CancellationToken, lease: Option<&dyn LeaseGuard>) -> bool {
    token.is_cancelled() || lease.map(|l| !l.is_held()).unwrap_or(false)
}
