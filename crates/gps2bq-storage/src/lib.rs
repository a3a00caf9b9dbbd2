// gps2bq-storage - Object-store staging area
//
// Staged batches are newline-delimited JSON blobs under deterministic
// keys, with a sibling .meta.json manifest carrying the object metadata.
// All backends go through one OpenDAL Operator: GCS in production,
// filesystem for local runs, memory for tests.

mod error;
mod key;
mod staging;

pub use error::StorageError;
pub use key::StagingKey;
pub use staging::{BatchSource, StagedMeta, StagedObject, StagingStore, UploadOutcome};

use gps2bq_config::{StagingBackend, StagingConfig};
use opendal::{services, Operator};

/// Build the operator for the configured backend.
pub fn build_operator(config: &StagingConfig) -> Result<Operator, StorageError> {
    let operator = match config.backend {
        StagingBackend::Gcs => {
            let builder = services::Gcs::default().bucket(&config.bucket);
            Operator::new(builder)
                .map_err(StorageError::from_opendal)?
                .finish()
        }
        StagingBackend::Fs => {
            let root = config.fs_root.as_deref().unwrap_or("./staging");
            let builder = services::Fs::default().root(root);
            Operator::new(builder)
                .map_err(StorageError::from_opendal)?
                .finish()
        }
        StagingBackend::Memory => {
            let builder = services::Memory::default();
            Operator::new(builder)
                .map_err(StorageError::from_opendal)?
                .finish()
        }
    };
    Ok(operator)
}
