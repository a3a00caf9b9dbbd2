// Staging seam used by the stage machine and the recovery sweeper.
//
// The production implementation is the OpenDAL-backed StagingStore;
// the integration tests wrap it with fault injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use gps2bq_core::{ProcessingId, StreamType};
use gps2bq_storage::{BatchSource, StagedObject, StagingStore, StorageError, UploadOutcome};

#[async_trait]
pub trait StagePort: Send + Sync {
    async fn upload(
        &self,
        stream: StreamType,
        processing_id: &ProcessingId,
        extracted_at: DateTime<Utc>,
        records: &[Value],
        source: BatchSource,
        backup_id: Option<String>,
    ) -> Result<UploadOutcome, StorageError>;

    async fn list(&self, stream: StreamType) -> Result<Vec<StagedObject>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    fn source_uri(&self, key: &str) -> String;
}

#[async_trait]
impl StagePort for StagingStore {
    async fn upload(
        &self,
        stream: StreamType,
        processing_id: &ProcessingId,
        extracted_at: DateTime<Utc>,
        records: &[Value],
        source: BatchSource,
        backup_id: Option<String>,
    ) -> Result<UploadOutcome, StorageError> {
        StagingStore::upload(self, stream, processing_id, extracted_at, records, source, backup_id)
            .await
    }

    async fn list(&self, stream: StreamType) -> Result<Vec<StagedObject>, StorageError> {
        StagingStore::list(self, stream).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        StagingStore::delete(self, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        StagingStore::exists(self, key).await
    }

    fn source_uri(&self, key: &str) -> String {
        StagingStore::source_uri(self, key)
    }
}
