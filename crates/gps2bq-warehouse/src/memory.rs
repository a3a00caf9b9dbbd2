// In-memory load client.
//
// Backs the hybrid controller's scratch destination (the dry-run flow
// must never touch the real dataset) and the integration tests, which
// script its failures.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use gps2bq_core::{InsertResult, LoadClient, LoadError, LoadRequest, LoadResult, StreamType};

#[derive(Default)]
struct MemoryInner {
    /// job_id -> records_loaded; replayed verbatim for duplicate jobs,
    /// mirroring the real job system's dedup window.
    completed_jobs: HashMap<String, usize>,
    /// Staged keys loaded, in order.
    loaded_keys: Vec<String>,
    inserted_rows: HashMap<StreamType, usize>,
    /// Failures consumed FIFO by subsequent load calls.
    scripted_load_failures: Vec<LoadError>,
    /// Failures consumed FIFO by subsequent insert calls.
    scripted_insert_failures: Vec<LoadError>,
}

#[derive(Default)]
pub struct MemoryLoadClient {
    inner: Mutex<MemoryInner>,
}

impl MemoryLoadClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next load call.
    pub fn fail_next_load(&self, error: LoadError) {
        self.inner.lock().scripted_load_failures.push(error);
    }

    /// Queue a failure for the next direct insert.
    pub fn fail_next_insert(&self, error: LoadError) {
        self.inner.lock().scripted_insert_failures.push(error);
    }

    pub fn loaded_keys(&self) -> Vec<String> {
        self.inner.lock().loaded_keys.clone()
    }

    pub fn total_records_loaded(&self) -> usize {
        self.inner.lock().completed_jobs.values().sum()
    }

    pub fn inserted_rows(&self, stream: StreamType) -> usize {
        self.inner
            .lock()
            .inserted_rows
            .get(&stream)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LoadClient for MemoryLoadClient {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResult, LoadError> {
        let mut inner = self.inner.lock();

        // Dedup window: a repeated job id replays its original result.
        if let Some(&records_loaded) = inner.completed_jobs.get(&request.job_id) {
            return Ok(LoadResult {
                job_id: request.job_id.clone(),
                records_loaded,
            });
        }

        if !inner.scripted_load_failures.is_empty() {
            return Err(inner.scripted_load_failures.remove(0));
        }

        inner
            .completed_jobs
            .insert(request.job_id.clone(), request.record_count);
        inner.loaded_keys.push(request.staged_key.clone());

        Ok(LoadResult {
            job_id: request.job_id.clone(),
            records_loaded: request.record_count,
        })
    }

    async fn insert_rows(
        &self,
        stream: StreamType,
        rows: &[Value],
    ) -> Result<InsertResult, LoadError> {
        let mut inner = self.inner.lock();

        if !inner.scripted_insert_failures.is_empty() {
            return Err(inner.scripted_insert_failures.remove(0));
        }

        *inner.inserted_rows.entry(stream).or_insert(0) += rows.len();
        Ok(InsertResult {
            rows_inserted: rows.len(),
        })
    }
}
