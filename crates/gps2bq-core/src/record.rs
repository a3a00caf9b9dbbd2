// Record parsing, field normalization and validation.
//
// Raw Redis payloads are free-form JSON. Records are discriminated by
// shape (presence of `userId` selects the mobile stream), alias keys are
// folded to canonical names, bounds are enforced, and every accepted
// record is stamped with a stable record id and processing timestamp.
// Unrecognized input fields are preserved and re-serialized verbatim.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Standard local@domain form.
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

pub const LAT_RANGE: (f64, f64) = (-90.0, 90.0);
pub const LNG_RANGE: (f64, f64) = (-180.0, 180.0);
pub const SPEED_RANGE: (f64, f64) = (0.0, 500.0);
pub const ALTITUDE_RANGE: (f64, f64) = (-500.0, 10_000.0);
pub const MAX_NAME_CHARS: usize = 100;

/// Alias keys folded to their canonical names before extraction.
const ALIASES: &[(&str, &str)] = &[
    ("latitude", "lat"),
    ("longitude", "lng"),
    ("lon", "lng"),
    ("alt", "altitude"),
    ("bearing", "heading"),
    ("time", "timestamp"),
];

/// A validated vehicle GPS point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsRecord {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub record_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated mobile-user point. Carries the full GPS shape plus the
/// user identity fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileRecord {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub record_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Why a record was dropped from the forward pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum RejectReason {
    MalformedJson,
    NotAnObject,
    MissingField(&'static str),
    InvalidField(&'static str),
    OutOfRange { field: &'static str, value: f64 },
    InvalidTimestamp,
    InvalidEmail,
    NameTooLong,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField(_) => "invalid_field",
            Self::OutOfRange { .. } => "out_of_range",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::InvalidEmail => "invalid_email",
            Self::NameTooLong => "name_too_long",
        }
    }
}

/// A rejected record, kept for statistics and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: RejectReason,
    /// Leading slice of the offending payload, capped for log hygiene.
    pub raw: String,
}

const RAW_SAMPLE_LEN: usize = 256;

impl RejectedRecord {
    pub fn new(index: usize, reason: RejectReason, raw: &str) -> Self {
        let raw = if raw.len() > RAW_SAMPLE_LEN {
            let mut end = RAW_SAMPLE_LEN;
            while !raw.is_char_boundary(end) {
                end -= 1;
            }
            raw[..end].to_string()
        } else {
            raw.to_string()
        };
        Self { index, reason, raw }
    }
}

/// Outcome of parsing one raw record.
#[derive(Debug, Clone)]
pub enum RecordKind {
    Gps(GpsRecord),
    Mobile(MobileRecord),
    Invalid(RejectedRecord),
}

/// Parse one raw payload into a tagged record variant.
///
/// `index` is the record's position within its drained batch and feeds
/// the generated record id.
pub fn parse_record(raw: &str, index: usize, processed_at: DateTime<Utc>) -> RecordKind {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            return RecordKind::Invalid(RejectedRecord::new(index, RejectReason::MalformedJson, raw))
        }
    };

    let mut obj = match value {
        Value::Object(map) => map,
        _ => return RecordKind::Invalid(RejectedRecord::new(index, RejectReason::NotAnObject, raw)),
    };

    fold_aliases(&mut obj);

    let result = if obj.contains_key("userId") {
        build_mobile(obj, index, processed_at).map(RecordKind::Mobile)
    } else {
        build_gps(obj, index, processed_at).map(RecordKind::Gps)
    };

    match result {
        Ok(kind) => kind,
        Err(reason) => RecordKind::Invalid(RejectedRecord::new(index, reason, raw)),
    }
}

fn fold_aliases(obj: &mut Map<String, Value>) {
    for (alias, canonical) in ALIASES {
        match obj.remove(*alias) {
            Some(v) if !obj.contains_key(*canonical) => {
                obj.insert((*canonical).to_string(), v);
            }
            // Canonical key wins over its alias.
            _ => {}
        }
    }
}

fn build_gps(
    mut obj: Map<String, Value>,
    index: usize,
    processed_at: DateTime<Utc>,
) -> Result<GpsRecord, RejectReason> {
    let device_id = take_id(&mut obj, "deviceId")?;
    let lat = take_bounded(&mut obj, "lat", LAT_RANGE)?.ok_or(RejectReason::MissingField("lat"))?;
    let lng = take_bounded(&mut obj, "lng", LNG_RANGE)?.ok_or(RejectReason::MissingField("lng"))?;
    let timestamp = take_timestamp(&mut obj)?;

    let speed = take_bounded(&mut obj, "speed", SPEED_RANGE)?;
    let heading = take_heading(&mut obj)?;
    let altitude = take_bounded(&mut obj, "altitude", ALTITUDE_RANGE)?;
    let accuracy = take_number(&mut obj, "accuracy")?;

    Ok(GpsRecord {
        record_id: record_id("gps", &device_id, timestamp, index),
        device_id,
        lat,
        lng,
        timestamp,
        speed,
        heading,
        altitude,
        accuracy,
        processed_at,
        extra: obj,
    })
}

fn build_mobile(
    mut obj: Map<String, Value>,
    index: usize,
    processed_at: DateTime<Utc>,
) -> Result<MobileRecord, RejectReason> {
    let user_id = take_id(&mut obj, "userId")?;

    let name = match obj.remove("name") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(_) => return Err(RejectReason::InvalidField("name")),
        None => return Err(RejectReason::MissingField("name")),
    };
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(RejectReason::NameTooLong);
    }

    let email = match obj.remove("email") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(RejectReason::InvalidField("email")),
        None => return Err(RejectReason::MissingField("email")),
    };
    if !EMAIL_RE.is_match(&email) {
        return Err(RejectReason::InvalidEmail);
    }

    let device_id = take_id(&mut obj, "deviceId")?;
    let lat = take_bounded(&mut obj, "lat", LAT_RANGE)?.ok_or(RejectReason::MissingField("lat"))?;
    let lng = take_bounded(&mut obj, "lng", LNG_RANGE)?.ok_or(RejectReason::MissingField("lng"))?;
    let timestamp = take_timestamp(&mut obj)?;

    let speed = take_bounded(&mut obj, "speed", SPEED_RANGE)?;
    let heading = take_heading(&mut obj)?;
    let altitude = take_bounded(&mut obj, "altitude", ALTITUDE_RANGE)?;
    let accuracy = take_number(&mut obj, "accuracy")?;

    Ok(MobileRecord {
        record_id: record_id("mobile", &user_id, timestamp, index),
        user_id,
        name,
        email,
        device_id,
        lat,
        lng,
        timestamp,
        speed,
        heading,
        altitude,
        accuracy,
        processed_at,
        extra: obj,
    })
}

/// `<type>_<deviceId|userId>_<epoch_ms>_<index>`
fn record_id(kind: &str, owner: &str, timestamp: DateTime<Utc>, index: usize) -> String {
    format!("{}_{}_{}_{}", kind, owner, timestamp.timestamp_millis(), index)
}

/// Identifier fields accept strings and numbers (producers are sloppy).
fn take_id(obj: &mut Map<String, Value>, key: &'static str) -> Result<String, RejectReason> {
    match obj.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(RejectReason::InvalidField(key)),
        None => Err(RejectReason::MissingField(key)),
    }
}

/// Numeric fields accept numbers and numeric strings.
fn take_number(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<f64>, RejectReason> {
    let value = match obj.remove(key) {
        Some(v) => v,
        None => return Ok(None),
    };
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Some(f)),
        _ => Err(RejectReason::InvalidField(key)),
    }
}

fn take_bounded(
    obj: &mut Map<String, Value>,
    key: &'static str,
    range: (f64, f64),
) -> Result<Option<f64>, RejectReason> {
    match take_number(obj, key)? {
        Some(v) if v < range.0 || v > range.1 => {
            Err(RejectReason::OutOfRange { field: key, value: v })
        }
        other => Ok(other),
    }
}

/// Headings wrap around instead of rejecting: 370 → 10, -5 → 355.
fn take_heading(obj: &mut Map<String, Value>) -> Result<Option<f64>, RejectReason> {
    Ok(take_number(obj, "heading")?.map(|h| h.rem_euclid(360.0)))
}

fn take_timestamp(obj: &mut Map<String, Value>) -> Result<DateTime<Utc>, RejectReason> {
    let value = obj
        .remove("timestamp")
        .ok_or(RejectReason::MissingField("timestamp"))?;
    parse_timestamp(&value).ok_or(RejectReason::InvalidTimestamp)
}

/// Numbers >= 10^12 are epoch milliseconds, smaller numbers are epoch
/// seconds; strings parse as RFC 3339.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if !f.is_finite() || f <= 0.0 {
                return None;
            }
            let millis = if f >= 1e12 { f } else { f * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> RecordKind {
        parse_record(raw, 0, Utc::now())
    }

    fn expect_gps(raw: &str) -> GpsRecord {
        match parse(raw) {
            RecordKind::Gps(r) => r,
            other => panic!("expected gps record, got {:?}", other),
        }
    }

    fn expect_invalid(raw: &str) -> RejectedRecord {
        match parse(raw) {
            RecordKind::Invalid(r) => r,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_gps_happy_path() {
        let rec = expect_gps(
            r#"{"deviceId":"bus-42","lat":-12.0464,"lng":-77.0428,"timestamp":1700000000000,"speed":35.5}"#,
        );
        assert_eq!(rec.device_id, "bus-42");
        assert_eq!(rec.speed, Some(35.5));
        assert!(rec.record_id.starts_with("gps_bus-42_1700000000000_"));
    }

    #[test]
    fn test_lat_boundary_inclusive() {
        expect_gps(r#"{"deviceId":"d","lat":90,"lng":-180,"timestamp":1700000000000}"#);
        let rejected =
            expect_invalid(r#"{"deviceId":"d","lat":90.0001,"lng":0,"timestamp":1700000000000}"#);
        assert_eq!(rejected.reason.code(), "out_of_range");
    }

    #[test]
    fn test_heading_wraps_around() {
        let rec = expect_gps(
            r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000,"heading":370}"#,
        );
        assert_eq!(rec.heading, Some(10.0));

        let rec = expect_gps(
            r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000,"heading":-5}"#,
        );
        assert_eq!(rec.heading, Some(355.0));
    }

    #[test]
    fn test_zero_zero_is_a_valid_point() {
        let rec = expect_gps(r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000}"#);
        assert_eq!(rec.lat, 0.0);
        assert_eq!(rec.lng, 0.0);
    }

    #[test]
    fn test_alias_folding() {
        let rec = expect_gps(
            r#"{"deviceId":"d","latitude":1.5,"lon":2.5,"time":1700000000000,"bearing":90,"alt":120}"#,
        );
        assert_eq!(rec.lat, 1.5);
        assert_eq!(rec.lng, 2.5);
        assert_eq!(rec.heading, Some(90.0));
        assert_eq!(rec.altitude, Some(120.0));
    }

    #[test]
    fn test_canonical_key_wins_over_alias() {
        let rec = expect_gps(
            r#"{"deviceId":"d","lat":1.0,"latitude":9.0,"lng":2.0,"timestamp":1700000000000}"#,
        );
        assert_eq!(rec.lat, 1.0);
        assert!(!rec.extra.contains_key("latitude"));
    }

    #[test]
    fn test_user_id_selects_mobile() {
        let raw = r#"{"userId":"u1","name":"Ana","email":"ana@example.com","deviceId":"ph-1","lat":-12.05,"lng":-77.05,"timestamp":1700000000000}"#;
        match parse(raw) {
            RecordKind::Mobile(rec) => {
                assert_eq!(rec.user_id, "u1");
                assert!(rec.record_id.starts_with("mobile_u1_"));
            }
            other => panic!("expected mobile record, got {:?}", other),
        }
    }

    #[test]
    fn test_mobile_rejects_bad_email() {
        let raw = r#"{"userId":"u1","name":"Ana","email":"not-an-email","deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000}"#;
        assert_eq!(expect_invalid(raw).reason, RejectReason::InvalidEmail);
    }

    #[test]
    fn test_mobile_rejects_long_name() {
        let name = "x".repeat(101);
        let raw = format!(
            r#"{{"userId":"u1","name":"{}","email":"a@b.co","deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000}}"#,
            name
        );
        assert_eq!(expect_invalid(&raw).reason, RejectReason::NameTooLong);
    }

    #[test]
    fn test_epoch_seconds_and_rfc3339_timestamps() {
        let rec = expect_gps(r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":1700000000}"#);
        assert_eq!(rec.timestamp.timestamp(), 1_700_000_000);

        let rec =
            expect_gps(r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":"2023-11-14T22:13:20Z"}"#);
        assert_eq!(rec.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(expect_invalid("{oops").reason, RejectReason::MalformedJson);
        assert_eq!(expect_invalid("[1,2]").reason, RejectReason::NotAnObject);
        assert_eq!(
            expect_invalid(r#"{"lat":0,"lng":0,"timestamp":1700000000000}"#).reason,
            RejectReason::MissingField("deviceId")
        );
    }

    #[test]
    fn test_extra_fields_survive_serialization() {
        let rec = expect_gps(
            r#"{"deviceId":"d","lat":0,"lng":0,"timestamp":1700000000000,"fleet":"north"}"#,
        );
        let out = serde_json::to_value(&rec).unwrap();
        assert_eq!(out["fleet"], "north");
        assert_eq!(out["deviceId"], "d");
    }

    #[test]
    fn test_rejected_raw_sample_is_capped() {
        let raw = format!(r#"{{"deviceId":"d","lat":999,"lng":0,"timestamp":1,"pad":"{}"}}"#, "y".repeat(1000));
        let rejected = expect_invalid(&raw);
        assert!(rejected.raw.len() <= RAW_SAMPLE_LEN);
    }
}
