// Async seams between the stage machine and its external collaborators.
//
// The Redis, object-store and warehouse crates implement these; the
// integration tests substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::stream::StreamType;

/// Result of draining one stream's Redis list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainResult {
    /// Records actually removed, in list order.
    pub records: Vec<String>,
    /// True iff the source key was cleared (false when it was empty).
    pub cleared: bool,
    /// List length observed after the drain. Producers pushing
    /// concurrently with the drain legitimately leave a residue.
    pub residual: usize,
}

/// Result of draining both streams in the fixed GPS-then-Mobile order.
#[derive(Debug, Clone, Serialize)]
pub struct DrainAllResult {
    pub gps: Option<DrainResult>,
    pub mobile: Option<DrainResult>,
    pub success: bool,
    #[serde(skip)]
    pub error: Option<SourceError>,
}

impl Default for DrainAllResult {
    fn default() -> Self {
        Self {
            gps: None,
            mobile: None,
            success: true,
            error: None,
        }
    }
}

impl DrainAllResult {
    pub fn stream(&self, stream: StreamType) -> Option<&DrainResult> {
        match stream {
            StreamType::Gps => self.gps.as_ref(),
            StreamType::Mobile => self.mobile.as_ref(),
        }
    }

    pub fn total_records(&self) -> usize {
        self.gps.as_ref().map(|r| r.records.len()).unwrap_or(0)
            + self.mobile.as_ref().map(|r| r.records.len()).unwrap_or(0)
    }
}

/// Failures reported by the Redis-facing components.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("redis unavailable: {0}")]
    Unavailable(String),
    #[error("drain atomicity violated on {stream}: {detail}")]
    AtomicityViolation { stream: StreamType, detail: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::RedisUnavailable,
            Self::AtomicityViolation { .. } => ErrorKind::DrainAtomicityViolation,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Destructive consumer of the per-stream Redis lists.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Read and clear one stream's list as a single logical step.
    async fn drain(&self, stream: StreamType) -> Result<DrainResult, SourceError>;

    /// Current list depth, read-only.
    async fn depth(&self, stream: StreamType) -> Result<usize, SourceError>;

    /// Drain both streams, GPS before Mobile, short-circuiting on the
    /// first failure. The partial result is returned with `success=false`
    /// so the caller can surface it.
    async fn drain_all(&self) -> DrainAllResult {
        let mut out = DrainAllResult::default();
        for stream in StreamType::ALL {
            match self.drain(stream).await {
                Ok(result) => match stream {
                    StreamType::Gps => out.gps = Some(result),
                    StreamType::Mobile => out.mobile = Some(result),
                },
                Err(err) => {
                    out.success = false;
                    out.error = Some(err);
                    break;
                }
            }
        }
        out
    }
}

/// Held lease on the pipeline's distributed lock.
///
/// Implementations heartbeat in the background while the guard lives and
/// must release unconditionally on drop.
#[async_trait]
pub trait LeaseGuard: Send + Sync {
    /// False once the lease has been lost; the holder must abort its
    /// cycle before any further state-mutating step.
    fn is_held(&self) -> bool;

    async fn release(self: Box<Self>);
}

/// Distributed mutual exclusion gating `drain_all`.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Returns `None` when another process holds the lock.
    async fn acquire(&self) -> Result<Option<Box<dyn LeaseGuard>>, SourceError>;
}

/// A staged-object load request for the warehouse.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub stream: StreamType,
    /// Object key inside the staging bucket.
    pub staged_key: String,
    /// Fully-qualified source URI handed to the load job.
    pub source_uri: String,
    /// Idempotency key; derived from the staged object key so a retried
    /// submission lands in the job system's dedup window.
    pub job_id: String,
    pub record_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub job_id: String,
    pub records_loaded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertResult {
    pub rows_inserted: usize,
}

/// Failures reported by the warehouse loader, pre-classified for the
/// caller's retry policy.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Retryable at the job level.
    #[error("transient load failure: {0}")]
    TransientJob(String),
    /// Permanent; the staged data does not fit the table.
    #[error("schema mismatch: {0}")]
    Schema(String),
    /// Retryable after a delay the caller chooses.
    #[error("quota exceeded: {message}")]
    Quota {
        message: String,
        retry_after: Duration,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientJob(_) => ErrorKind::LoadTransient,
            Self::Schema(_) => ErrorKind::LoadSchema,
            Self::Quota { .. } => ErrorKind::LoadQuota,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Warehouse sink. `load` ingests a staged blob; `insert_rows` is the
/// legacy direct path. Neither deletes the staged object.
#[async_trait]
pub trait LoadClient: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResult, LoadError>;

    async fn insert_rows(
        &self,
        stream: StreamType,
        rows: &[serde_json::Value],
    ) -> Result<InsertResult, LoadError>;
}

/// Alert classes surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StagePermanent,
    SpoolBudgetExhausted,
    SpoolCorruption,
    SpoolHighWater,
    Rollback,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StagePermanent => "stage_permanent",
            Self::SpoolBudgetExhausted => "spool_budget_exhausted",
            Self::SpoolCorruption => "spool_corruption",
            Self::SpoolHighWater => "spool_high_water",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamType>,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stream: None,
            at: Utc::now(),
        }
    }

    pub fn for_stream(mut self, stream: StreamType) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Alert delivery seam. Webhook/email transports live outside the core;
/// the default production sink logs through `tracing`.
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: AlertEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSource {
        fail_gps: bool,
    }

    #[async_trait]
    impl QueueSource for ScriptedSource {
        async fn drain(&self, stream: StreamType) -> Result<DrainResult, SourceError> {
            if stream == StreamType::Gps && self.fail_gps {
                return Err(SourceError::Unavailable("connection refused".into()));
            }
            Ok(DrainResult {
                records: vec![format!("{{\"stream\":\"{}\"}}", stream)],
                cleared: true,
                residual: 0,
            })
        }

        async fn depth(&self, _stream: StreamType) -> Result<usize, SourceError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_drain_all_order_and_success() {
        let source = ScriptedSource { fail_gps: false };
        let all = source.drain_all().await;
        assert!(all.success);
        assert_eq!(all.total_records(), 2);
        assert!(all.gps.is_some());
        assert!(all.mobile.is_some());
    }

    #[tokio::test]
    async fn test_drain_all_short_circuits_on_gps_failure() {
        let source = ScriptedSource { fail_gps: true };
        let all = source.drain_all().await;
        assert!(!all.success);
        assert!(all.gps.is_none());
        assert!(all.mobile.is_none(), "mobile must not be drained after a gps failure");
        assert_eq!(all.error.unwrap().kind(), ErrorKind::RedisUnavailable);
    }
}
