// gps2bq-core - Data model and component seams
//
// Everything the pipeline crates agree on lives here: the two telemetry
// streams, record parsing and validation, immutable drained batches,
// per-cycle outcome reporting, the closed error-code taxonomy, and the
// async trait seams implemented by the Redis / warehouse crates.

pub mod batch;
pub mod error;
pub mod outcome;
pub mod record;
pub mod separate;
pub mod stream;
pub mod traits;

pub use batch::{Batch, ProcessingId};
pub use error::ErrorKind;
pub use outcome::{CycleOutcome, DrainSummary, ReplayOutcome, StageMarker, TypeOutcome};
pub use record::{GpsRecord, MobileRecord, RecordKind, RejectReason, RejectedRecord};
pub use separate::{separate, validate, Separated, SeparationStats, Validated};
pub use stream::StreamType;
pub use traits::{
    AlertEvent, AlertKind, AlertSink, DrainAllResult, DrainResult, InsertResult, LeaseGuard,
    LeaseLock, LoadClient, LoadError, LoadRequest, LoadResult, QueueSource, SourceError,
};

/// Generate a short random nonce, hex-encoded.
///
/// Used for processing ids, spool file names and lock holder tokens.
pub fn nonce(bytes: usize) -> String {
    use rand::RngCore;

    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_length_and_charset() {
        let n = nonce(4);
        assert_eq!(n.len(), 8);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
