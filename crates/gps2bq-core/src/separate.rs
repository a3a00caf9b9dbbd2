// Record-wise separation of a drained batch into its typed streams.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::record::{parse_record, GpsRecord, MobileRecord, RecordKind, RejectedRecord};
use crate::stream::StreamType;

/// Separation counters, including per-reason reject tallies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeparationStats {
    pub total: usize,
    pub gps: usize,
    pub mobile: usize,
    pub invalid: usize,
    pub reject_reasons: BTreeMap<&'static str, usize>,
}

/// A drained batch split by shape, with rejects kept aside.
#[derive(Debug, Default)]
pub struct Separated {
    pub gps: Vec<GpsRecord>,
    pub mobile: Vec<MobileRecord>,
    pub invalid: Vec<RejectedRecord>,
    pub stats: SeparationStats,
}

/// Split raw records into GPS vs Mobile by structural discrimination,
/// rejecting malformed records with a reason code. Invalid records are
/// dropped from the forward pipeline but counted in the statistics.
pub fn separate(records: &[String], processed_at: DateTime<Utc>) -> Separated {
    let mut out = Separated {
        stats: SeparationStats {
            total: records.len(),
            ..Default::default()
        },
        ..Default::default()
    };

    for (index, raw) in records.iter().enumerate() {
        match parse_record(raw, index, processed_at) {
            RecordKind::Gps(rec) => {
                out.stats.gps += 1;
                out.gps.push(rec);
            }
            RecordKind::Mobile(rec) => {
                out.stats.mobile += 1;
                out.mobile.push(rec);
            }
            RecordKind::Invalid(rejected) => {
                out.stats.invalid += 1;
                *out
                    .stats
                    .reject_reasons
                    .entry(rejected.reason.code())
                    .or_insert(0) += 1;
                out.invalid.push(rejected);
            }
        }
    }

    out
}

/// Validation outcome for one stream's records.
#[derive(Debug, Default)]
pub struct Validated {
    /// Serialized canonical records, ready for NDJSON staging.
    pub valid: Vec<Value>,
    pub invalid: Vec<RejectedRecord>,
}

/// Validate pre-parsed records against one stream's required shape.
///
/// Records whose shape matches the other stream are rejected here; the
/// caller chose the stream.
pub fn validate(stream: StreamType, records: &[Value], processed_at: DateTime<Utc>) -> Validated {
    let mut out = Validated::default();

    for (index, value) in records.iter().enumerate() {
        let raw = value.to_string();
        match (stream, parse_record(&raw, index, processed_at)) {
            (StreamType::Gps, RecordKind::Gps(rec)) => {
                out.valid.push(serde_json::to_value(rec).unwrap_or(Value::Null));
            }
            (StreamType::Mobile, RecordKind::Mobile(rec)) => {
                out.valid.push(serde_json::to_value(rec).unwrap_or(Value::Null));
            }
            (_, RecordKind::Invalid(rejected)) => out.invalid.push(rejected),
            (_, RecordKind::Gps(_) | RecordKind::Mobile(_)) => {
                out.invalid.push(RejectedRecord::new(
                    index,
                    crate::record::RejectReason::InvalidField("stream"),
                    &raw,
                ));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gps_raw(device: &str) -> String {
        format!(
            r#"{{"deviceId":"{}","lat":-12.0464,"lng":-77.0428,"timestamp":1700000000000}}"#,
            device
        )
    }

    fn mobile_raw(user: &str) -> String {
        format!(
            r#"{{"userId":"{}","name":"Ana","email":"ana@example.com","deviceId":"ph-1","lat":-12.05,"lng":-77.05,"timestamp":1700000000000}}"#,
            user
        )
    }

    #[test]
    fn test_separate_mixed_batch() {
        let records = vec![
            gps_raw("A"),
            mobile_raw("u1"),
            gps_raw("B"),
            "not json".to_string(),
        ];
        let separated = separate(&records, Utc::now());

        assert_eq!(separated.stats.total, 4);
        assert_eq!(separated.stats.gps, 2);
        assert_eq!(separated.stats.mobile, 1);
        assert_eq!(separated.stats.invalid, 1);
        assert_eq!(separated.stats.reject_reasons["malformed_json"], 1);
        assert_eq!(separated.gps[0].device_id, "A");
        assert_eq!(separated.gps[1].device_id, "B");
    }

    #[test]
    fn test_validate_rejects_cross_stream_records() {
        let mobile: Value = serde_json::from_str(&mobile_raw("u1")).unwrap();
        let validated = validate(StreamType::Gps, &[mobile], Utc::now());
        assert!(validated.valid.is_empty());
        assert_eq!(validated.invalid.len(), 1);
    }

    #[test]
    fn test_validate_emits_canonical_records() {
        let gps: Value = serde_json::from_str(&gps_raw("A")).unwrap();
        let validated = validate(StreamType::Gps, &[gps], Utc::now());
        assert_eq!(validated.valid.len(), 1);
        let rec = &validated.valid[0];
        assert_eq!(rec["deviceId"], "A");
        assert!(rec["recordId"].as_str().unwrap().starts_with("gps_A_"));
    }

    #[test]
    fn test_empty_batch_separates_to_nothing() {
        let separated = separate(&[], Utc::now());
        assert_eq!(separated.stats.total, 0);
        assert!(separated.gps.is_empty() && separated.mobile.is_empty());
    }
}
