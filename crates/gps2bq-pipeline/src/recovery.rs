// Recovery sweeper for orphaned staged objects and overdue spool work.
//
// Orphans appear when a cycle stages a batch and then fails the load:
// the staged object is the sole source of truth until a load succeeds.
// The sweeper re-drives those loads, reclaims staged objects whose
// earlier cleanup failed, returns spool entries stranded in
// `processing` by a crash, and runs the spool retention sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use gps2bq_core::{LoadClient, LoadRequest, StreamType};
use gps2bq_spool::SpoolStore;
use gps2bq_storage::StagedObject;
use gps2bq_warehouse::job_id_for_key;

use crate::ledger::Ledger;
use crate::ports::StagePort;

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Staged objects younger than this are skipped; they may belong
    /// to an in-flight cycle.
    pub min_orphan_age: Duration,
    pub cleanup_processed: bool,
    /// Spool retention window for completed entries.
    pub retention: Duration,
}

/// What one sweep observed and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub orphans_found: usize,
    pub orphans_loaded: usize,
    pub orphan_failures: usize,
    pub already_loaded_reclaimed: usize,
    pub spool_pending: usize,
    pub stale_processing_recovered: usize,
    pub spool_reclaimed: usize,
}

pub struct RecoverySweeper {
    staging: Arc<dyn StagePort>,
    warehouse: Arc<dyn LoadClient>,
    spool: SpoolStore,
    ledger: Arc<Ledger>,
    settings: RecoverySettings,
}

impl RecoverySweeper {
    pub fn new(
        staging: Arc<dyn StagePort>,
        warehouse: Arc<dyn LoadClient>,
        spool: SpoolStore,
        ledger: Arc<Ledger>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            staging,
            warehouse,
            spool,
            ledger,
            settings,
        }
    }

    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for stream in StreamType::ALL {
            match self.staging.list(stream).await {
                Ok(objects) => {
                    for object in objects {
                        self.consider(stream, object, &mut report).await;
                    }
                }
                Err(e) => warn!(stream = stream.as_str(), error = %e, "orphan listing failed"),
            }
        }

        // Surface spool work the scheduler has not retried yet.
        match self.spool.pending_batches().await {
            Ok(pending) => report.spool_pending = pending.len(),
            Err(e) => warn!(error = %e, "spool pending scan failed during recovery"),
        }

        match self
            .spool
            .recover_stale_processing(self.settings.min_orphan_age)
            .await
        {
            Ok(recovered) => report.stale_processing_recovered = recovered,
            Err(e) => warn!(error = %e, "stale-processing recovery failed"),
        }

        match self.spool.sweep_completed(self.settings.retention).await {
            Ok(reclaimed) => report.spool_reclaimed = reclaimed,
            Err(e) => warn!(error = %e, "spool retention sweep failed"),
        }

        info!(
            orphans = report.orphans_found,
            loaded = report.orphans_loaded,
            failures = report.orphan_failures,
            spool_pending = report.spool_pending,
            "recovery sweep finished"
        );
        report
    }

    async fn consider(&self, stream: StreamType, object: StagedObject, report: &mut RecoveryReport) {
        let age = match object.last_modified {
            Some(at) => (Utc::now() - at)
                .to_std()
                .unwrap_or(Duration::from_secs(0)),
            // No timestamp; err on the side of not racing a cycle.
            None => Duration::from_secs(0),
        };
        if age < self.settings.min_orphan_age {
            return;
        }

        if self.ledger.has_load(&object.key) {
            // Loaded but never cleaned up; finish the cleanup.
            if self.settings.cleanup_processed {
                match self.staging.delete(&object.key).await {
                    Ok(()) => {
                        report.already_loaded_reclaimed += 1;
                        debug!(key = %object.key, "reclaimed staged object with recorded load");
                    }
                    Err(e) => warn!(key = %object.key, error = %e, "orphan cleanup failed"),
                }
            }
            return;
        }

        report.orphans_found += 1;
        let record_count = object
            .meta
            .as_ref()
            .map(|m| m.record_count)
            .unwrap_or(0);

        let request = LoadRequest {
            stream,
            source_uri: self.staging.source_uri(&object.key),
            job_id: job_id_for_key(&object.key),
            staged_key: object.key.clone(),
            record_count,
        };

        match self.warehouse.load(&request).await {
            Ok(result) => {
                report.orphans_loaded += 1;
                self.ledger.record_load(&object.key, result.records_loaded);
                info!(key = %object.key, records = result.records_loaded, "orphaned staged object loaded");
                if self.settings.cleanup_processed {
                    if let Err(e) = self.staging.delete(&object.key).await {
                        warn!(key = %object.key, error = %e, "cleanup after orphan load failed");
                    }
                }
            }
            Err(e) => {
                report.orphan_failures += 1;
                warn!(key = %object.key, error = %e, "orphan load failed; will retry next sweep");
            }
        }
    }
}
