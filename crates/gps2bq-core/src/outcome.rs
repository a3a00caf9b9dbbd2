// Structured per-cycle outcome reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorKind;
use crate::stream::StreamType;
use crate::traits::DrainAllResult;

/// How far a stream's batch progressed within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMarker {
    Extract,
    Stage,
    Load,
    Complete,
}

impl StageMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Stage => "stage",
            Self::Load => "load",
            Self::Complete => "complete",
        }
    }
}

/// Per-stream result of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TypeOutcome {
    pub stream: StreamType,
    pub stage: StageMarker,
    pub records_processed: usize,
    pub records_loaded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_id: Option<String>,
    pub backup_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TypeOutcome {
    pub fn new(stream: StreamType) -> Self {
        Self {
            stream,
            stage: StageMarker::Extract,
            records_processed: 0,
            records_loaded: 0,
            staged_key: None,
            spool_id: None,
            backup_created: false,
            error: None,
            error_kind: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What the drain step observed, per stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainSummary {
    pub gps_records: usize,
    pub gps_cleared: bool,
    pub mobile_records: usize,
    pub mobile_cleared: bool,
}

impl From<&DrainAllResult> for DrainSummary {
    fn from(all: &DrainAllResult) -> Self {
        Self {
            gps_records: all.gps.as_ref().map(|r| r.records.len()).unwrap_or(0),
            gps_cleared: all.gps.as_ref().map(|r| r.cleared).unwrap_or(false),
            mobile_records: all.mobile.as_ref().map(|r| r.records.len()).unwrap_or(0),
            mobile_cleared: all.mobile.as_ref().map(|r| r.cleared).unwrap_or(false),
        }
    }
}

/// Replay attempt for one spool entry within a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub spool_id: String,
    pub stream: StreamType,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Produced by the stage machine per invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub total_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<DrainSummary>,
    pub replayed: Vec<ReplayOutcome>,
    pub per_type: Vec<TypeOutcome>,
    pub processing_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl CycleOutcome {
    pub fn skipped(reason: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            total_records: 0,
            extraction: None,
            replayed: Vec::new(),
            per_type: Vec::new(),
            processing_ms: 0,
            started_at,
        }
    }

    pub fn records_loaded(&self) -> usize {
        self.per_type.iter().map(|t| t.records_loaded).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DrainResult;

    #[test]
    fn test_stage_markers() {
        assert_eq!(StageMarker::Extract.as_str(), "extract");
        assert_eq!(StageMarker::Complete.as_str(), "complete");
    }

    #[test]
    fn test_drain_summary_from_partial_result() {
        let all = DrainAllResult {
            gps: Some(DrainResult {
                records: vec!["a".into(), "b".into()],
                cleared: true,
                residual: 0,
            }),
            mobile: None,
            success: false,
            error: None,
        };
        let summary = DrainSummary::from(&all);
        assert_eq!(summary.gps_records, 2);
        assert!(summary.gps_cleared);
        assert_eq!(summary.mobile_records, 0);
        assert!(!summary.mobile_cleared);
    }

    #[test]
    fn test_skipped_outcome() {
        let outcome = CycleOutcome::skipped("busy", Utc::now());
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("busy"));
        assert_eq!(outcome.total_records, 0);
    }
}
