// File-per-entry spool store.
//
// Ownership: the active lock holder is the only writer; the HTTP
// surface reads concurrently, which is safe because every write is an
// atomic rename of a fully-written temporary file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use gps2bq_core::{nonce, ErrorKind, LoadResult, ProcessingId, StreamType};

use crate::entry::{BackupState, SpoolEntry, SpoolPayload};
use crate::SpoolError;

const ENTRY_PREFIX: &str = "backup_";
const ENTRY_SUFFIX: &str = ".json";
const QUARANTINE_SUFFIX: &str = ".quarantined";

/// Aggregate counts over the spool directory.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpoolStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub quarantined: usize,
}

#[derive(Clone)]
pub struct SpoolStore {
    dir: PathBuf,
    max_retries: u32,
}

impl SpoolStore {
    /// Open (and create) the spool directory.
    pub async fn open(dir: impl Into<PathBuf>, max_retries: u32) -> Result<Self, SpoolError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, max_retries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a batch that could not be uploaded. Returns the durable
    /// entry; its id doubles as the file stem.
    pub async fn store(
        &self,
        stream: StreamType,
        processing_id: &ProcessingId,
        extracted_at: DateTime<Utc>,
        records: Vec<Value>,
    ) -> Result<SpoolEntry, SpoolError> {
        if records.is_empty() {
            return Err(SpoolError::InvalidInput(
                "refusing to spool an empty batch".to_string(),
            ));
        }

        let id = format!(
            "{}{}_{}_{}",
            ENTRY_PREFIX,
            stream.as_str(),
            Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ"),
            nonce(4)
        );

        let entry = SpoolEntry::new(
            id,
            stream,
            self.max_retries,
            SpoolPayload {
                processing_id: processing_id.as_str().to_string(),
                extracted_at,
                records,
            },
        );

        self.write_entry(&entry).await?;
        debug!(id = %entry.id, stream = stream.as_str(), records = entry.payload.records.len(), "spooled batch");
        Ok(entry)
    }

    /// All readable entries, quarantining corrupt files as they are
    /// found. Order is unspecified; callers sort.
    pub async fn load_all(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if !name.starts_with(ENTRY_PREFIX) || !name.ends_with(ENTRY_SUFFIX) {
                continue;
            }
            match self.read_entry_file(&item.path()).await {
                Ok(entry) => entries.push(entry),
                Err(SpoolError::Corruption { id, detail }) => {
                    warn!(id = %id, detail = %detail, "quarantined corrupt spool entry");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Entries eligible for replay, oldest first. FIFO across
    /// independent failures prevents starvation.
    pub async fn pending_batches(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        let mut pending: Vec<SpoolEntry> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|e| e.is_retryable())
            .collect();
        pending.sort_by_key(|e| e.created_at);
        Ok(pending)
    }

    pub async fn pending_count(&self) -> Result<usize, SpoolError> {
        Ok(self.pending_batches().await?.len())
    }

    /// Take an entry for a retry attempt.
    pub async fn mark_processing(&self, id: &str) -> Result<SpoolEntry, SpoolError> {
        let mut entry = self.read_entry(id).await?;
        if entry.state.is_terminal() {
            return Err(SpoolError::InvalidInput(format!(
                "entry {} is terminal ({})",
                id,
                entry.state.as_str()
            )));
        }
        if entry.retry_count >= entry.max_retries {
            return Err(SpoolError::BudgetExhausted(id.to_string()));
        }
        entry.mark_processing();
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Transient failure: back to pending while budget remains, else
    /// terminal failed. Returns the updated entry.
    pub async fn mark_attempt_failed(
        &self,
        id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<SpoolEntry, SpoolError> {
        let mut entry = self.read_entry(id).await?;
        if entry.retry_count >= entry.max_retries {
            entry.mark_failed(kind, message);
            self.write_entry(&entry).await?;
            return Err(SpoolError::BudgetExhausted(id.to_string()));
        }
        entry.mark_pending(kind, message);
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    pub async fn mark_completed(
        &self,
        id: &str,
        load_result: Option<LoadResult>,
    ) -> Result<SpoolEntry, SpoolError> {
        let mut entry = self.read_entry(id).await?;
        entry.mark_completed(load_result);
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    pub async fn mark_failed(
        &self,
        id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<SpoolEntry, SpoolError> {
        let mut entry = self.read_entry(id).await?;
        entry.mark_failed(kind, message);
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Delete an entry outright. Only called after a confirmed
    /// successful load of its contents.
    pub async fn remove(&self, id: &str) -> Result<(), SpoolError> {
        let path = self.entry_path(id);
        fs::remove_file(&path).await?;
        debug!(id, "removed spool entry");
        Ok(())
    }

    /// Return entries stranded in `processing` by a crashed cycle to
    /// `pending`, without consuming retry budget.
    pub async fn recover_stale_processing(
        &self,
        older_than: Duration,
    ) -> Result<usize, SpoolError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut recovered = 0;

        for mut entry in self.load_all().await? {
            if entry.state != BackupState::Processing {
                continue;
            }
            let stamp = entry.last_attempt.unwrap_or(entry.created_at);
            if stamp < cutoff {
                entry.state = BackupState::Pending;
                self.write_entry(&entry).await?;
                recovered += 1;
                warn!(id = %entry.id, "recovered spool entry stranded in processing");
            }
        }
        Ok(recovered)
    }

    /// Reclaim completed entries older than the retention window.
    /// Pending and failed entries are preserved regardless of age.
    pub async fn sweep_completed(&self, retention: Duration) -> Result<usize, SpoolError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reclaimed = 0;

        for entry in self.load_all().await? {
            if entry.state != BackupState::Completed {
                continue;
            }
            let stamp = entry.processed_at.unwrap_or(entry.created_at);
            if stamp < cutoff {
                self.remove(&entry.id).await?;
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(reclaimed, "spool retention sweep reclaimed completed entries");
        }
        Ok(reclaimed)
    }

    pub async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let mut stats = SpoolStats::default();

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if name.ends_with(QUARANTINE_SUFFIX) {
                stats.quarantined += 1;
            }
        }

        for entry in self.load_all().await? {
            match entry.state {
                BackupState::Pending => stats.pending += 1,
                BackupState::Processing => stats.processing += 1,
                BackupState::Completed => stats.completed += 1,
                BackupState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    pub async fn read_entry(&self, id: &str) -> Result<SpoolEntry, SpoolError> {
        let path = self.entry_path(id);
        if !path.exists() {
            return Err(SpoolError::NotFound(id.to_string()));
        }
        self.read_entry_file(&path).await
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, ENTRY_SUFFIX))
    }

    async fn read_entry_file(&self, path: &Path) -> Result<SpoolEntry, SpoolError> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let bytes = fs::read(path).await?;
        let entry: SpoolEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.quarantine(path).await?;
                return Err(SpoolError::Corruption {
                    id,
                    detail: format!("unparseable document: {}", e),
                });
            }
        };

        if !entry.verify_checksum() {
            self.quarantine(path).await?;
            return Err(SpoolError::Corruption {
                id: entry.id,
                detail: "stored checksum disagrees with payload".to_string(),
            });
        }

        Ok(entry)
    }

    /// Move a corrupt file aside; never silently dropped.
    async fn quarantine(&self, path: &Path) -> Result<(), SpoolError> {
        let mut target = path.as_os_str().to_owned();
        target.push(QUARANTINE_SUFFIX);
        fs::rename(path, PathBuf::from(target)).await?;
        Ok(())
    }

    /// Write-temp-then-rename; atomic at the file level.
    async fn write_entry(&self, entry: &SpoolEntry) -> Result<(), SpoolError> {
        let final_path = self.entry_path(&entry.id);
        let tmp_path = self.dir.join(format!(".tmp-{}-{}", entry.id, nonce(4)));

        let bytes = serde_json::to_vec_pretty(entry)
            .map_err(|e| SpoolError::Io(format!("entry serialization: {}", e)))?;

        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}
