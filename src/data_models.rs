use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::errors::TimestampError;

/// One channel cell after loader conventions have been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Number(f64),
    /// Empty cell or the configured sentinel.
    Missing,
    /// Non-empty text that does not parse as a number.
    Text(String),
}

/// One source row in its native wide shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRecord {
    /// 1-based line number in the source file.
    pub line: u64,
    pub date: Option<String>,
    pub time: Option<String>,
    /// `None` when the file has no such column; `Some("")` for an empty cell.
    pub sensor_id: Option<String>,
    /// Same convention as `sensor_id`.
    pub location: Option<String>,
    /// Channel columns in header order.
    pub channels: Vec<(String, ChannelValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedRecord {
    pub raw: RawRecord,
    pub ts: Result<DateTime<Utc>, TimestampError>,
}

/// A single long-form observation, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub sensor_id: String,
    pub ts: DateTime<Utc>,
    pub source: String,
    pub location: Option<String>,
    pub reading_type: String,
    pub reading_value: f64,
    pub unit: Option<String>,
    pub file_name: String,
}

impl NormalizedReading {
    /// Stable identity of this reading: SHA-256 over
    /// `sensor_id|ts|reading_type|file_name`, hex encoded.
    pub fn dedupe_key(&self) -> String {
        dedupe_key(&self.sensor_id, &self.ts, &self.reading_type, &self.file_name)
    }
}

pub fn dedupe_key(sensor_id: &str, ts: &DateTime<Utc>, reading_type: &str, file_name: &str) -> String {
    let ts = ts.to_rfc3339_opts(SecondsFormat::AutoSi, false);
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", sensor_id, ts, reading_type, file_name).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    #[serde(rename = "missing required field")]
    MissingRequiredField,
    #[serde(rename = "value out of range")]
    OutOfRange,
    #[serde(rename = "malformed value")]
    MalformedValue,
    #[serde(rename = "duplicate reading")]
    DuplicateReading,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingRequiredField => "missing required field",
            RejectReason::OutOfRange => "value out of range",
            RejectReason::MalformedValue => "malformed value",
            RejectReason::DuplicateReading => "duplicate reading",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rejected row or field. Collected, never raised, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub file_name: String,
    pub row_reference: u64,
    pub reading_type: Option<String>,
    pub error_reason: RejectReason,
    pub detail: Option<String>,
}

/// Per-file, per-reading-type rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAggregate {
    pub file_name: String,
    pub source: String,
    pub reading_type: String,
    pub count: i64,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    /// Sample standard deviation; `None` for a single reading.
    pub stddev_value: Option<f64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

/// Everything one file contributes to the store, written as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBatch {
    pub file_name: String,
    pub readings: Vec<NormalizedReading>,
    pub aggregates: Vec<FileAggregate>,
}
