//! Staging failures, pre-classified for the caller's retry policy.

use gps2bq_core::ErrorKind;
use thiserror::Error;

/// No implicit retry happens at this layer; transient vs permanent is
/// the signal the stage machine keys its spool divert on.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Network, rate limit, timeout. Worth retrying.
    #[error("transient staging failure: {0}")]
    Transient(String),
    /// Authorization, malformed request, unsupported operation.
    #[error("permanent staging failure: {0}")]
    Permanent(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn from_opendal(err: opendal::Error) -> Self {
        use opendal::ErrorKind as K;
        match err.kind() {
            K::RateLimited => Self::Transient(err.to_string()),
            K::PermissionDenied | K::ConfigInvalid | K::Unsupported => {
                Self::Permanent(err.to_string())
            }
            _ if err.is_temporary() => Self::Transient(err.to_string()),
            // Unclassified I/O errors are presumed retryable; the spool
            // bounds how long we keep believing that.
            K::Unexpected => Self::Transient(err.to_string()),
            _ => Self::Permanent(err.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::StageTransient,
            Self::Permanent(_) => ErrorKind::StagePermanent,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
