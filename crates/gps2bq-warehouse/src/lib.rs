// gps2bq-warehouse - Warehouse load clients
//
// The production client drives BigQuery-style REST load jobs: submit a
// job keyed by the staged object, poll it to completion, classify the
// failure. The legacy direct path goes through streaming inserts. An
// in-memory client backs the hybrid controller's scratch destination
// and the test suites.

mod bigquery;
mod memory;
mod token;

pub use bigquery::BigQueryClient;
pub use memory::MemoryLoadClient;
pub use token::{NoAuth, StaticToken, TokenProvider};

/// BigQuery job ids admit `[A-Za-z0-9_-]` only; staged keys carry
/// slashes and dots. The mapping must stay deterministic because the
/// job id is the idempotency key.
pub fn job_id_for_key(staged_key: &str) -> String {
    let sanitized: String = staged_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("gps2bq_{}", sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_is_deterministic_and_sanitized() {
        let a = job_id_for_key("gps-data/2026-08-01/gps_1_beef.jsonl");
        let b = job_id_for_key("gps-data/2026-08-01/gps_1_beef.jsonl");
        assert_eq!(a, b);
        assert_eq!(a, "gps2bq_gps-data_2026-08-01_gps_1_beef_jsonl");
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
