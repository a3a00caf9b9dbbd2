// Spool entry model and its state machine.
//
// pending ⇄ processing → {completed, failed}

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use gps2bq_core::{ErrorKind, LoadResult, StreamType};

/// Bound on the per-entry error history.
const MAX_ERROR_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One observed failure, kept in a bounded sliding history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObservation {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// The verbatim batch carried by an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolPayload {
    pub processing_id: String,
    pub extracted_at: DateTime<Utc>,
    pub records: Vec<Value>,
}

impl SpoolPayload {
    /// CRC32 over the records, one JSON document per line.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                hasher.update(b"\n");
            }
            hasher.update(record.to_string().as_bytes());
        }
        hasher.finalize()
    }
}

/// Durable record of a batch that could not be uploaded directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub id: String,
    pub stream: StreamType,
    pub created_at: DateTime<Utc>,
    pub state: BackupState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub errors: Vec<ErrorObservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_result: Option<LoadResult>,
    /// Stored at write time, verified on read.
    pub checksum: u32,
    pub payload: SpoolPayload,
}

impl SpoolEntry {
    /// An entry is created by a failed direct upload, which counts as
    /// the first attempt: `retry_count` starts at 1 and the backoff
    /// clock starts at creation.
    pub fn new(
        id: String,
        stream: StreamType,
        max_retries: u32,
        payload: SpoolPayload,
    ) -> Self {
        let checksum = payload.checksum();
        let created_at = Utc::now();
        Self {
            id,
            stream,
            created_at,
            state: BackupState::Pending,
            retry_count: 1,
            max_retries,
            errors: Vec::new(),
            last_attempt: Some(created_at),
            processed_at: None,
            load_result: None,
            checksum,
            payload,
        }
    }

    /// Eligible for the next replay pass.
    pub fn is_retryable(&self) -> bool {
        self.state == BackupState::Pending && self.retry_count < self.max_retries
    }

    /// Take-for-retry: consumes one unit of the retry budget.
    pub fn mark_processing(&mut self) {
        self.state = BackupState::Processing;
        self.retry_count += 1;
        self.last_attempt = Some(Utc::now());
    }

    /// Transient failure with budget remaining.
    pub fn mark_pending(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.push_error(kind, message);
        self.state = BackupState::Pending;
    }

    pub fn mark_completed(&mut self, load_result: Option<LoadResult>) {
        self.state = BackupState::Completed;
        self.processed_at = Some(Utc::now());
        self.load_result = load_result;
    }

    /// Terminal failure; the entry is retained for inspection.
    pub fn mark_failed(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.push_error(kind, message);
        self.state = BackupState::Failed;
    }

    fn push_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.errors.len() >= MAX_ERROR_HISTORY {
            self.errors.remove(0);
        }
        self.errors.push(ErrorObservation {
            at: Utc::now(),
            kind,
            message: message.into(),
        });
    }

    /// Earliest moment the scheduler should retry this entry:
    /// `base_delay * 2^(retry_count - 1)` after the last attempt.
    pub fn next_attempt_after(&self, base_delay: Duration) -> Option<DateTime<Utc>> {
        let last = self.last_attempt?;
        let shift = self.retry_count.saturating_sub(1).min(16);
        let delay = base_delay.saturating_mul(1u32 << shift);
        Some(last + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero()))
    }

    /// Whether the backoff window has elapsed.
    pub fn due(&self, base_delay: Duration, now: DateTime<Utc>) -> bool {
        match self.next_attempt_after(base_delay) {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        self.payload.checksum() == self.checksum
    }
}
