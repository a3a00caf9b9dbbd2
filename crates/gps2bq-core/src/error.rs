//! Closed error-code taxonomy shared across the pipeline crates.
//!
//! Components classify their failures into these codes so that the stage
//! machine, the ledger and the HTTP surface can react without inspecting
//! error text. Codes only, no stack traces.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RedisUnavailable,
    LockContention,
    DrainAtomicityViolation,
    SeparationFailed,
    ValidationRejected,
    StageTransient,
    StagePermanent,
    LoadTransient,
    LoadSchema,
    LoadQuota,
    SpoolIo,
    SpoolCorruption,
    SpoolBudgetExhausted,
    ConfigInvalid,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RedisUnavailable => "redis_unavailable",
            Self::LockContention => "lock_contention",
            Self::DrainAtomicityViolation => "drain_atomicity_violation",
            Self::SeparationFailed => "separation_failed",
            Self::ValidationRejected => "validation_rejected",
            Self::StageTransient => "stage_transient",
            Self::StagePermanent => "stage_permanent",
            Self::LoadTransient => "load_transient",
            Self::LoadSchema => "load_schema",
            Self::LoadQuota => "load_quota",
            Self::SpoolIo => "spool_io",
            Self::SpoolCorruption => "spool_corruption",
            Self::SpoolBudgetExhausted => "spool_budget_exhausted",
            Self::ConfigInvalid => "config_invalid",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a retry without operator intervention can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RedisUnavailable
                | Self::LockContention
                | Self::StageTransient
                | Self::LoadTransient
                | Self::LoadQuota
                | Self::SpoolIo
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::RedisUnavailable.as_str(), "redis_unavailable");
        assert_eq!(ErrorKind::StagePermanent.as_str(), "stage_permanent");
        assert_eq!(
            ErrorKind::SpoolBudgetExhausted.as_str(),
            "spool_budget_exhausted"
        );
        assert_eq!(ErrorKind::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::StageTransient.is_transient());
        assert!(ErrorKind::LoadQuota.is_transient());
        assert!(!ErrorKind::StagePermanent.is_transient());
        assert!(!ErrorKind::LoadSchema.is_transient());
        assert!(!ErrorKind::SpoolCorruption.is_transient());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DrainAtomicityViolation).unwrap();
        assert_eq!(json, "\"drain_atomicity_violation\"");
    }
}
