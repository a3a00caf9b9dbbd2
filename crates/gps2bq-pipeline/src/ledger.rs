// Metrics ledger: in-memory counters with a persisted snapshot.
//
// Never in the critical path. Every recording method is infallible
// from the caller's perspective; persistence failures are logged and
// swallowed. Writes are serialized by the inner mutex; the ledger is a
// process-wide singleton owned by main and shared through Arc.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gps2bq_core::{AlertEvent, CycleOutcome, StreamType};

/// Ring capacities.
const RECENT_CYCLES: usize = 50;
const RETRY_RING: usize = 100;
const ALERT_RING: usize = 100;
const COMPARISON_RING: usize = 50;
/// Successful-load keys kept for orphan detection. The warehouse's
/// job-id dedup backstops anything evicted from here.
const LOADED_KEY_RING: usize = 4096;

/// Per-stream operation counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamCounters {
    pub batches_total: u64,
    pub batches_successful: u64,
    pub batches_failed: u64,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub bytes_staged: u64,
    pub backups_created: u64,
    pub total_time_ms: u64,
}

/// One hybrid comparison observation, kept for human review.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRecord {
    pub at: DateTime<Utc>,
    pub new_success: bool,
    pub legacy_success: bool,
    pub new_records: usize,
    pub legacy_records: usize,
    pub new_ms: u64,
    pub legacy_ms: u64,
    pub consistent: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerInner {
    cycles_total: u64,
    cycles_empty: u64,
    cycles_failed: u64,
    lock_contention: u64,
    gps: StreamCounters,
    mobile: StreamCounters,
    /// Staged keys with a confirmed successful load, insertion order.
    loaded_keys: VecDeque<String>,
    #[serde(skip)]
    loaded_index: HashSet<String>,
    #[serde(skip)]
    recent_cycles: VecDeque<bool>,
    #[serde(skip)]
    retry_times: VecDeque<DateTime<Utc>>,
    #[serde(skip)]
    alerts: VecDeque<AlertEvent>,
    #[serde(skip)]
    comparisons: VecDeque<ComparisonRecord>,
}

impl LedgerInner {
    fn stream_mut(&mut self, stream: StreamType) -> &mut StreamCounters {
        match stream {
            StreamType::Gps => &mut self.gps,
            StreamType::Mobile => &mut self.mobile,
        }
    }
}

/// Read-only view assembled for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub cycles_total: u64,
    pub cycles_empty: u64,
    pub cycles_failed: u64,
    pub lock_contention: u64,
    pub gps: StreamCounters,
    pub mobile: StreamCounters,
    pub recent_success_rate: f64,
    pub average_cycle_ms: f64,
    pub alerts: Vec<AlertEvent>,
    pub comparisons: Vec<ComparisonRecord>,
}

pub struct Ledger {
    inner: Mutex<LedgerInner>,
    snapshot_path: PathBuf,
}

impl Ledger {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Restore counters from the last persisted snapshot, if any.
    pub async fn load_persisted(&self) {
        let bytes = match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        match serde_json::from_slice::<LedgerInner>(&bytes) {
            Ok(mut restored) => {
                restored.loaded_index = restored.loaded_keys.iter().cloned().collect();
                *self.inner.lock() = restored;
                debug!(path = %self.snapshot_path.display(), "restored ledger snapshot");
            }
            Err(e) => warn!(error = %e, "ignoring unreadable ledger snapshot"),
        }
    }

    /// Record one cycle outcome and emit the operational counters.
    pub fn record_cycle(&self, outcome: &CycleOutcome) {
        counter!("gps2bq.cycles", 1);
        histogram!("gps2bq.cycle_ms", outcome.processing_ms as f64);

        let mut inner = self.inner.lock();
        inner.cycles_total += 1;
        if !outcome.success {
            inner.cycles_failed += 1;
            counter!("gps2bq.cycles_failed", 1);
        }
        if outcome.reason.as_deref() == Some("busy") {
            inner.lock_contention += 1;
            counter!("gps2bq.lock_contention", 1);
        }
        if outcome.success && outcome.total_records == 0 {
            inner.cycles_empty += 1;
        }

        // Busy skips are contention, not pipeline health; keep them out
        // of the success-rate ring.
        if outcome.reason.as_deref() != Some("busy") {
            if inner.recent_cycles.len() >= RECENT_CYCLES {
                inner.recent_cycles.pop_front();
            }
            inner.recent_cycles.push_back(outcome.success);
        }

        for per_type in &outcome.per_type {
            let time_share = outcome.processing_ms / outcome.per_type.len().max(1) as u64;
            let counters = inner.stream_mut(per_type.stream);
            counters.batches_total += 1;
            counters.records_processed += per_type.records_processed as u64;
            counters.records_loaded += per_type.records_loaded as u64;
            counters.total_time_ms += time_share;
            if per_type.succeeded() {
                counters.batches_successful += 1;
            } else {
                counters.batches_failed += 1;
            }
            if per_type.backup_created {
                counters.backups_created += 1;
            }
            counter!(
                "gps2bq.records_processed",
                per_type.records_processed as u64,
                "stream" => per_type.stream.as_str()
            );
        }
    }

    pub fn record_rejects(&self, stream: StreamType, count: usize) {
        if count == 0 {
            return;
        }
        counter!("gps2bq.records_rejected", count as u64, "stream" => stream.as_str());
        self.inner.lock().stream_mut(stream).records_rejected += count as u64;
    }

    pub fn record_bytes_staged(&self, stream: StreamType, bytes: u64) {
        counter!("gps2bq.bytes_staged", bytes, "stream" => stream.as_str());
        self.inner.lock().stream_mut(stream).bytes_staged += bytes;
    }

    /// Remember a confirmed successful load of a staged key.
    pub fn record_load(&self, staged_key: &str, records: usize) {
        counter!("gps2bq.records_loaded", records as u64);
        let mut inner = self.inner.lock();
        if inner.loaded_index.insert(staged_key.to_string()) {
            if inner.loaded_keys.len() >= LOADED_KEY_RING {
                if let Some(evicted) = inner.loaded_keys.pop_front() {
                    inner.loaded_index.remove(&evicted);
                }
            }
            inner.loaded_keys.push_back(staged_key.to_string());
        }
    }

    /// Whether a staged key has a confirmed successful load on record.
    pub fn has_load(&self, staged_key: &str) -> bool {
        self.inner.lock().loaded_index.contains(staged_key)
    }

    pub fn record_retry(&self, at: DateTime<Utc>) {
        counter!("gps2bq.spool_retries", 1);
        let mut inner = self.inner.lock();
        if inner.retry_times.len() >= RETRY_RING {
            inner.retry_times.pop_front();
        }
        inner.retry_times.push_back(at);
    }

    pub fn record_alert(&self, event: AlertEvent) {
        counter!("gps2bq.alerts", 1, "kind" => event.kind.as_str());
        let mut inner = self.inner.lock();
        if inner.alerts.len() >= ALERT_RING {
            inner.alerts.pop_front();
        }
        inner.alerts.push_back(event);
    }

    pub fn record_comparison(&self, record: ComparisonRecord) {
        if !record.consistent {
            counter!("gps2bq.comparison_discrepancies", 1);
        }
        let mut inner = self.inner.lock();
        if inner.comparisons.len() >= COMPARISON_RING {
            inner.comparisons.pop_front();
        }
        inner.comparisons.push_back(record);
    }

    /// Success rate over the recent-cycle ring; 1.0 when nothing ran.
    pub fn recent_success_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.recent_cycles.is_empty() {
            return 1.0;
        }
        let ok = inner.recent_cycles.iter().filter(|s| **s).count();
        ok as f64 / inner.recent_cycles.len() as f64
    }

    pub fn summary(&self) -> LedgerSummary {
        let inner = self.inner.lock();
        let ok = inner.recent_cycles.iter().filter(|s| **s).count();
        let rate = if inner.recent_cycles.is_empty() {
            1.0
        } else {
            ok as f64 / inner.recent_cycles.len() as f64
        };
        let total_time = inner.gps.total_time_ms + inner.mobile.total_time_ms;
        let total_batches = inner.gps.batches_total + inner.mobile.batches_total;
        LedgerSummary {
            cycles_total: inner.cycles_total,
            cycles_empty: inner.cycles_empty,
            cycles_failed: inner.cycles_failed,
            lock_contention: inner.lock_contention,
            gps: inner.gps,
            mobile: inner.mobile,
            recent_success_rate: rate,
            average_cycle_ms: if total_batches == 0 {
                0.0
            } else {
                total_time as f64 / total_batches as f64
            },
            alerts: inner.alerts.iter().cloned().collect(),
            comparisons: inner.comparisons.iter().cloned().collect(),
        }
    }

    /// Persist the snapshot; failures are logged and swallowed.
    pub async fn persist(&self) {
        let bytes = {
            let inner = self.inner.lock();
            match serde_json::to_vec_pretty(&*inner) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "ledger snapshot serialization failed");
                    return;
                }
            }
        };

        if let Some(parent) = self.snapshot_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let tmp = self.snapshot_path.with_extension("json.tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.snapshot_path).await
        };
        if let Err(e) = write.await {
            warn!(error = %e, path = %self.snapshot_path.display(), "ledger snapshot write failed");
        }
    }
}
