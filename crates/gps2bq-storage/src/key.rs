// Deterministic staging keys: `<prefix>/<YYYY-MM-DD>/<processing-id>.jsonl`

use chrono::{DateTime, NaiveDate, Utc};

use gps2bq_core::{ProcessingId, StreamType};

pub const DATA_SUFFIX: &str = ".jsonl";
pub const META_SUFFIX: &str = ".meta.json";

/// A parsed or freshly-derived staging key.
///
/// The date component comes from the batch extraction timestamp, so
/// re-staging the same processing id always lands on the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingKey {
    pub prefix: String,
    pub date: NaiveDate,
    pub processing_id: String,
}

impl StagingKey {
    pub fn derive(prefix: &str, processing_id: &ProcessingId, extracted_at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            date: extracted_at.date_naive(),
            processing_id: processing_id.as_str().to_string(),
        }
    }

    /// Object key of the NDJSON blob.
    pub fn data_key(&self) -> String {
        format!(
            "{}/{}/{}{}",
            self.prefix,
            self.date.format("%Y-%m-%d"),
            self.processing_id,
            DATA_SUFFIX
        )
    }

    /// Object key of the sibling metadata manifest.
    pub fn meta_key(&self) -> String {
        meta_key_for(&self.data_key())
    }

    /// Parse a listed object key back into its parts. Returns `None`
    /// for keys that are not staged data blobs (manifests, strays).
    pub fn parse(key: &str) -> Option<Self> {
        let stem = key.strip_suffix(DATA_SUFFIX)?;
        let mut parts = stem.rsplitn(3, '/');
        let processing_id = parts.next()?;
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let prefix = parts.next()?;
        Some(Self {
            prefix: prefix.to_string(),
            date,
            processing_id: processing_id.to_string(),
        })
    }

    /// Which stream a key belongs to, by its configured prefix.
    pub fn stream_for(&self, gps_prefix: &str, mobile_prefix: &str) -> Option<StreamType> {
        if self.prefix == gps_prefix.trim_end_matches('/') {
            Some(StreamType::Gps)
        } else if self.prefix == mobile_prefix.trim_end_matches('/') {
            Some(StreamType::Mobile)
        } else {
            None
        }
    }
}

/// Manifest key for a data key.
pub fn meta_key_for(data_key: &str) -> String {
    format!("{}{}", data_key, META_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_shape_and_determinism() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 12, 30, 0).unwrap();
        let id = ProcessingId::from_string("gps_1787500000000_a1b2c3d4".to_string());
        let key = StagingKey::derive("gps-data", &id, at);
        assert_eq!(key.data_key(), "gps-data/2026-08-01/gps_1787500000000_a1b2c3d4.jsonl");
        assert_eq!(
            key.meta_key(),
            "gps-data/2026-08-01/gps_1787500000000_a1b2c3d4.jsonl.meta.json"
        );
        // Same id + timestamp always derives the same key.
        assert_eq!(key, StagingKey::derive("gps-data/", &id, at));
    }

    #[test]
    fn test_parse_round_trip() {
        let parsed = StagingKey::parse("mobile-data/2026-08-01/mobile_1_beef.jsonl").unwrap();
        assert_eq!(parsed.prefix, "mobile-data");
        assert_eq!(parsed.processing_id, "mobile_1_beef");
        assert_eq!(
            parsed.stream_for("gps-data", "mobile-data"),
            Some(StreamType::Mobile)
        );
    }

    #[test]
    fn test_parse_rejects_manifests_and_strays() {
        assert!(StagingKey::parse("gps-data/2026-08-01/x.jsonl.meta.json").is_none());
        assert!(StagingKey::parse("gps-data/not-a-date/x.jsonl").is_none());
        assert!(StagingKey::parse("x.jsonl").is_none());
    }
}
