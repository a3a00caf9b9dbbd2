// Immutable drained batches and their processing ids.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::stream::StreamType;

/// Unique identifier per cycle per stream.
///
/// Derives the idempotent staging key and the warehouse job id, so the
/// format is load-bearing: `<type>_<epoch_ms>_<nonce>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProcessingId(String);

impl ProcessingId {
    pub fn generate(stream: StreamType, at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}_{}_{}",
            stream.as_str(),
            at.timestamp_millis(),
            crate::nonce(4)
        ))
    }

    /// Rebuild from a previously-issued id (spool replay, key parsing).
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered batch of raw records drained atomically from one Redis list.
///
/// Never mutated after construction; downstream stages produce new state
/// records that reference the batch by processing id.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub processing_id: ProcessingId,
    pub stream: StreamType,
    pub records: Vec<String>,
    pub extracted_at: DateTime<Utc>,
    pub record_count: usize,
    /// CRC32 over the newline-joined payload.
    pub checksum: u32,
    pub byte_size: usize,
}

impl Batch {
    pub fn new(stream: StreamType, records: Vec<String>, extracted_at: DateTime<Utc>) -> Self {
        let checksum = payload_checksum(&records);
        let byte_size = serialized_size(&records);
        Self {
            processing_id: ProcessingId::generate(stream, extracted_at),
            stream,
            record_count: records.len(),
            checksum,
            byte_size,
            records,
            extracted_at,
        }
    }

    /// Reconstruct a batch under an existing processing id (spool replay).
    pub fn with_id(
        processing_id: ProcessingId,
        stream: StreamType,
        records: Vec<String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        let checksum = payload_checksum(&records);
        let byte_size = serialized_size(&records);
        Self {
            processing_id,
            stream,
            record_count: records.len(),
            checksum,
            byte_size,
            records,
            extracted_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Stable 32-bit content hash of the newline-joined payload.
pub fn payload_checksum(records: &[String]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(record.as_bytes());
    }
    hasher.finalize()
}

fn serialized_size(records: &[String]) -> usize {
    let newlines = records.len().saturating_sub(1);
    records.iter().map(|r| r.len()).sum::<usize>() + newlines
}
