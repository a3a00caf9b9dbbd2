// The two telemetry streams and their per-stream wiring.

use serde::{Deserialize, Serialize};

/// Closed enumeration of the ingested telemetry streams.
///
/// Each stream owns a Redis list, a staging prefix in the object store
/// and a warehouse table. The accessors return the well-known defaults;
/// deployments can override the Redis keys through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Gps,
    Mobile,
}

impl StreamType {
    /// Processing order is fixed: GPS before Mobile.
    pub const ALL: [StreamType; 2] = [StreamType::Gps, StreamType::Mobile];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Gps => "gps",
            StreamType::Mobile => "mobile",
        }
    }

    /// Default Redis list key for this stream.
    pub fn redis_key(&self) -> &'static str {
        match self {
            StreamType::Gps => "gps:history:global",
            StreamType::Mobile => "mobile:history:global",
        }
    }

    /// Default object-store prefix for staged blobs of this stream.
    pub fn staging_prefix(&self) -> &'static str {
        match self {
            StreamType::Gps => "gps-data",
            StreamType::Mobile => "mobile-data",
        }
    }

    /// Default warehouse table for this stream.
    pub fn table(&self) -> &'static str {
        match self {
            StreamType::Gps => "gps_records",
            StreamType::Mobile => "mobile_records",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gps" => Ok(StreamType::Gps),
            "mobile" => Ok(StreamType::Mobile),
            other => Err(format!("unknown stream type: {}", other)),
        }
    }
}
