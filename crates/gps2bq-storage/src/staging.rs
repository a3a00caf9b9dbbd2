// The staging store: upload, list, delete, exists.

use chrono::{DateTime, Utc};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use gps2bq_config::{StagingBackend, StagingConfig};
use gps2bq_core::{ProcessingId, StreamType};

use crate::error::StorageError;
use crate::key::{meta_key_for, StagingKey, DATA_SUFFIX};

/// How the staged records entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    AtomicExtraction,
    LocalBackup,
}

/// Metadata manifest attached to every staged object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedMeta {
    pub stream: StreamType,
    pub record_count: usize,
    pub source: BatchSource,
    pub processing_id: String,
    /// Original spool entry id when the batch came out of the backup
    /// spool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Handle to an immutable staged blob.
#[derive(Debug, Clone, Serialize)]
pub struct StagedObject {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<StagedMeta>,
}

/// Result of an upload attempt. Re-staging an already-staged processing
/// id is observed, not overwritten.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Created(StagedObject),
    AlreadyExists(StagedObject),
}

impl UploadOutcome {
    pub fn object(&self) -> &StagedObject {
        match self {
            Self::Created(o) | Self::AlreadyExists(o) => o,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Staging area over one OpenDAL operator.
#[derive(Clone)]
pub struct StagingStore {
    op: Operator,
    backend: StagingBackend,
    bucket: String,
    gps_prefix: String,
    mobile_prefix: String,
    upload_timeout: Duration,
}

impl StagingStore {
    pub fn new(op: Operator, config: &StagingConfig) -> Self {
        Self {
            op,
            backend: config.backend,
            bucket: config.bucket.clone(),
            gps_prefix: config.gps_prefix.trim_end_matches('/').to_string(),
            mobile_prefix: config.mobile_prefix.trim_end_matches('/').to_string(),
            upload_timeout: config.upload_timeout(),
        }
    }

    pub fn prefix(&self, stream: StreamType) -> &str {
        match stream {
            StreamType::Gps => &self.gps_prefix,
            StreamType::Mobile => &self.mobile_prefix,
        }
    }

    /// Fully-qualified URI for a staged key, as the warehouse sees it.
    pub fn source_uri(&self, key: &str) -> String {
        match self.backend {
            StagingBackend::Gcs => format!("gs://{}/{}", self.bucket, key),
            StagingBackend::Fs => format!("file://{}", key),
            StagingBackend::Memory => format!("memory://{}", key),
        }
    }

    /// Upload one batch as NDJSON under its deterministic key.
    ///
    /// Atomic at the object level; the metadata manifest is written
    /// first so a listed data object always has its sidecar. Uploading
    /// an existing processing id reports `AlreadyExists` and changes
    /// nothing.
    pub async fn upload(
        &self,
        stream: StreamType,
        processing_id: &ProcessingId,
        extracted_at: DateTime<Utc>,
        records: &[Value],
        source: BatchSource,
        backup_id: Option<String>,
    ) -> Result<UploadOutcome, StorageError> {
        let key = StagingKey::derive(self.prefix(stream), processing_id, extracted_at);
        let data_key = key.data_key();

        let meta = StagedMeta {
            stream,
            record_count: records.len(),
            source,
            processing_id: processing_id.as_str().to_string(),
            backup_id,
            created_at: Utc::now(),
        };

        if self.exists(&data_key).await? {
            debug!(key = %data_key, "staged object already exists; treating as success");
            let existing = self.stat_object(&data_key).await?;
            return Ok(UploadOutcome::AlreadyExists(existing));
        }

        let body = ndjson_body(records);
        let size = body.len() as u64;

        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| StorageError::Permanent(format!("metadata serialization: {}", e)))?;

        let write = async {
            self.op
                .write(&key.meta_key(), meta_bytes)
                .await
                .map_err(StorageError::from_opendal)?;
            self.op
                .write(&data_key, body)
                .await
                .map_err(StorageError::from_opendal)?;
            Ok::<(), StorageError>(())
        };

        match tokio::time::timeout(self.upload_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(StorageError::Transient(format!(
                    "upload timed out after {:?}",
                    self.upload_timeout
                )))
            }
        }

        debug!(key = %data_key, records = meta.record_count, "staged batch");
        Ok(UploadOutcome::Created(StagedObject {
            key: data_key,
            size,
            last_modified: Some(meta.created_at),
            meta: Some(meta),
        }))
    }

    /// List staged data objects under a stream's prefix, with their
    /// manifests. Manifests without a data object are skipped (a failed
    /// upload left them behind).
    pub async fn list(&self, stream: StreamType) -> Result<Vec<StagedObject>, StorageError> {
        let root = format!("{}/", self.prefix(stream));
        let entries = self
            .op
            .list_with(&root)
            .recursive(true)
            .await
            .map_err(StorageError::from_opendal)?;

        let mut objects = Vec::new();
        for entry in entries {
            if !entry.path().ends_with(DATA_SUFFIX) {
                continue;
            }
            match self.stat_object(entry.path()).await {
                Ok(object) => objects.push(object),
                Err(e) => warn!(key = entry.path(), error = %e, "skipping unreadable staged object"),
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Delete a staged object and its manifest. Only called after a
    /// confirmed successful load.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.op.delete(key).await.map_err(StorageError::from_opendal)?;
        // Sidecar second: a data-less manifest is harmless, the
        // opposite would lose the metadata of a live object.
        self.op
            .delete(&meta_key_for(key))
            .await
            .map_err(StorageError::from_opendal)?;
        debug!(key, "deleted staged object");
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.op.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_opendal(e)),
        }
    }

    async fn stat_object(&self, key: &str) -> Result<StagedObject, StorageError> {
        let stat = self.op.stat(key).await.map_err(StorageError::from_opendal)?;

        let meta = match self.op.read(&meta_key_for(key)).await {
            Ok(buf) => serde_json::from_slice::<StagedMeta>(&buf.to_vec()).ok(),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::from_opendal(e)),
        };

        Ok(StagedObject {
            key: key.to_string(),
            size: stat.content_length(),
            last_modified: stat.last_modified(),
            meta,
        })
    }
}

/// One record per line, UTF-8, trailing newline.
fn ndjson_body(records: &[Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for record in records {
        body.extend_from_slice(record.to_string().as_bytes());
        body.push(b'\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_store() -> StagingStore {
        let config = StagingConfig {
            backend: StagingBackend::Memory,
            ..Default::default()
        };
        let op = crate::build_operator(&config).unwrap();
        StagingStore::new(op, &config)
    }

    fn sample_records() -> Vec<Value> {
        vec![
            json!({"deviceId": "A", "lat": -12.0464, "lng": -77.0428}),
            json!({"deviceId": "B", "lat": -12.05, "lng": -77.05}),
        ]
    }

    #[tokio::test]
    async fn test_upload_and_list() {
        let store = memory_store();
        let id = ProcessingId::from_string("gps_1700000000000_cafe0001".into());
        let at = Utc::now();

        let outcome = store
            .upload(
                StreamType::Gps,
                &id,
                at,
                &sample_records(),
                BatchSource::AtomicExtraction,
                None,
            )
            .await
            .unwrap();

        assert!(!outcome.already_existed());
        let object = outcome.object();
        assert!(object.key.starts_with("gps-data/"));
        assert!(object.key.ends_with(".jsonl"));

        let listed = store.list(StreamType::Gps).await.unwrap();
        assert_eq!(listed.len(), 1);
        let meta = listed[0].meta.as_ref().expect("manifest present");
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.source, BatchSource::AtomicExtraction);
        assert_eq!(meta.processing_id, id.as_str());
    }

    #[tokio::test]
    async fn test_second_upload_is_already_exists() {
        let store = memory_store();
        let id = ProcessingId::from_string("gps_1700000000000_cafe0002".into());
        let at = Utc::now();

        let first = store
            .upload(StreamType::Gps, &id, at, &sample_records(), BatchSource::AtomicExtraction, None)
            .await
            .unwrap();
        let second = store
            .upload(StreamType::Gps, &id, at, &sample_records(), BatchSource::AtomicExtraction, None)
            .await
            .unwrap();

        assert!(!first.already_existed());
        assert!(second.already_existed());
        assert_eq!(first.object().key, second.object().key);
        assert_eq!(store.list(StreamType::Gps).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_object_and_manifest() {
        let store = memory_store();
        let id = ProcessingId::from_string("mobile_1700000000000_cafe0003".into());
        let outcome = store
            .upload(
                StreamType::Mobile,
                &id,
                Utc::now(),
                &sample_records(),
                BatchSource::LocalBackup,
                Some("backup_mobile_x".into()),
            )
            .await
            .unwrap();

        let key = outcome.object().key.clone();
        assert!(store.exists(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert!(store.list(StreamType::Mobile).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ndjson_body_one_record_per_line() {
        let body = ndjson_body(&sample_records());
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
        let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["deviceId"], "A");
    }

    #[test]
    fn test_source_uri_by_backend() {
        let store = memory_store();
        assert_eq!(store.source_uri("a/b.jsonl"), "memory://a/b.jsonl");
    }
}
