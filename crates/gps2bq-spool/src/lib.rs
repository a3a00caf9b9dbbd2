// gps2bq-spool - Durable local backup spool
//
// Batches that could not be uploaded are written here, one
// self-describing JSON file per entry, and replayed by later cycles
// with a bounded exponential-backoff budget. Writes go through a
// neighboring temporary name and an atomic rename, so a crash never
// leaves a half-written entry. Stored checksums are verified on every
// read; a mismatch quarantines the file rather than dropping it.

mod entry;
mod store;

pub use entry::{BackupState, ErrorObservation, SpoolEntry, SpoolPayload};
pub use store::{SpoolStats, SpoolStore};

use gps2bq_core::ErrorKind;
use thiserror::Error;

/// Spool failure classes.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Rejected before anything touched disk.
    #[error("invalid spool input: {0}")]
    InvalidInput(String),
    #[error("spool io failure: {0}")]
    Io(String),
    /// Stored checksum disagrees with the payload; the file has been
    /// moved aside for inspection.
    #[error("corrupt spool entry {id}: {detail}")]
    Corruption { id: String, detail: String },
    /// The entry spent its whole retry budget.
    #[error("retry budget exhausted for spool entry {0}")]
    BudgetExhausted(String),
    #[error("unknown spool entry {0}")]
    NotFound(String),
}

impl SpoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::ValidationRejected,
            Self::Io(_) | Self::NotFound(_) => ErrorKind::SpoolIo,
            Self::Corruption { .. } => ErrorKind::SpoolCorruption,
            Self::BudgetExhausted(_) => ErrorKind::SpoolBudgetExhausted,
        }
    }
}

impl From<std::io::Error> for SpoolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
