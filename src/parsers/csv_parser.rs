//! Loader for semicolon-separated, decimal-comma measurement files.

use crate::config::PipelineConfig;
use crate::data_models::{ChannelValue, RawRecord};
use crate::errors::LoadError;
use csv::{ReaderBuilder, StringRecord};
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const DATE_COLUMN: &str = "Date";
const TIME_COLUMN: &str = "Time";
const SENSOR_ID_COLUMNS: &[&str] = &["sensor_id", "sensorid", "sensor"];
const LOCATION_COLUMNS: &[&str] = &["location"];

/// Source-specific conventions applied while loading.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConvention {
    pub delimiter: u8,
    pub decimal_comma: bool,
    pub sentinel: Option<f64>,
}

impl Default for LoaderConvention {
    fn default() -> Self {
        Self {
            delimiter: b';',
            decimal_comma: true,
            sentinel: Some(-200.0),
        }
    }
}

impl LoaderConvention {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            delimiter: config.delimiter,
            decimal_comma: true,
            sentinel: config.sentinel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnRole {
    Date,
    Time,
    SensorId,
    Location,
    Channel,
    /// Placeholder columns (`Unnamed: 15`, empty header) are dropped.
    Anonymous,
}

fn classify_header(name: &str) -> ColumnRole {
    let lower = name.to_lowercase();
    if lower.is_empty() || lower.starts_with("unnamed") {
        ColumnRole::Anonymous
    } else if lower == DATE_COLUMN.to_lowercase() {
        ColumnRole::Date
    } else if lower == TIME_COLUMN.to_lowercase() {
        ColumnRole::Time
    } else if SENSOR_ID_COLUMNS.contains(&lower.as_str()) {
        ColumnRole::SensorId
    } else if LOCATION_COLUMNS.contains(&lower.as_str()) {
        ColumnRole::Location
    } else {
        ColumnRole::Channel
    }
}

/// Load one file from disk into wide-form records.
pub fn load_file(path: &Path, convention: &LoaderConvention) -> Result<Vec<RawRecord>, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_reader(file, path, convention)
}

/// Load wide-form records from any reader; `path` is used for error context only.
pub fn load_reader<R: Read>(
    input: R,
    path: &Path,
    convention: &LoaderConvention,
) -> Result<Vec<RawRecord>, LoadError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(convention.delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| LoadError::from_csv(path.to_path_buf(), e))?
        .clone();

    let columns: Vec<(String, ColumnRole)> = headers
        .iter()
        .map(|h| {
            let name = h.trim_start_matches('\u{feff}').trim().to_string();
            let role = classify_header(&name);
            (name, role)
        })
        .collect();

    for (required, role) in [(DATE_COLUMN, ColumnRole::Date), (TIME_COLUMN, ColumnRole::Time)] {
        if !columns.iter().any(|(_, r)| *r == role) {
            return Err(LoadError::MissingColumn {
                path: path.to_path_buf(),
                column: required.to_string(),
            });
        }
    }

    let dropped = columns
        .iter()
        .filter(|(_, r)| *r == ColumnRole::Anonymous)
        .count();
    if dropped > 0 {
        debug!("Dropping {} anonymous column(s) in {}", dropped, path.display());
    }

    let mut records = Vec::new();
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => return Err(LoadError::from_csv(path.to_path_buf(), e)),
        }

        // Trailing `;;;;` lines carry nothing at all.
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let line = record.position().map(|p| p.line()).unwrap_or(0);
        records.push(build_record(&record, line, &columns, convention));
    }

    if records.is_empty() {
        return Err(LoadError::NoRows {
            path: path.to_path_buf(),
        });
    }

    debug!("Loaded {} rows from {}", records.len(), path.display());
    Ok(records)
}

fn build_record(
    record: &StringRecord,
    line: u64,
    columns: &[(String, ColumnRole)],
    convention: &LoaderConvention,
) -> RawRecord {
    let mut raw = RawRecord {
        line,
        ..Default::default()
    };

    for (index, (name, role)) in columns.iter().enumerate() {
        let field = get_field_by_index(record, index);
        match role {
            ColumnRole::Date => raw.date = field.map(str::to_string),
            ColumnRole::Time => raw.time = field.map(str::to_string),
            // Present-but-empty identity cells stay distinguishable from absent columns.
            ColumnRole::SensorId => raw.sensor_id = Some(field.unwrap_or("").to_string()),
            ColumnRole::Location => raw.location = Some(field.unwrap_or("").to_string()),
            ColumnRole::Channel => {
                let value = match field {
                    Some(v) => parse_channel_value(v, convention),
                    None => ChannelValue::Missing,
                };
                raw.channels.push((name.clone(), value));
            }
            ColumnRole::Anonymous => {}
        }
    }
    raw
}

// Returns None for absent, empty or whitespace-only fields
fn get_field_by_index(record: &StringRecord, index: usize) -> Option<&str> {
    record
        .get(index)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Apply decimal and sentinel conventions to one non-empty channel cell.
pub fn parse_channel_value(value: &str, convention: &LoaderConvention) -> ChannelValue {
    let trimmed = value.trim().trim_matches('"');
    if trimmed.is_empty() {
        return ChannelValue::Missing;
    }
    let parsed = if convention.decimal_comma {
        parse_comma_decimal(trimmed)
    } else {
        trimmed.parse::<f64>()
    };
    match parsed {
        Ok(num) if convention.sentinel == Some(num) => ChannelValue::Missing,
        Ok(num) => ChannelValue::Number(num),
        Err(_) => ChannelValue::Text(trimmed.to_string()),
    }
}

// Helper function to parse comma-decimal strings
pub fn parse_comma_decimal(s: &str) -> Result<f64, std::num::ParseFloatError> {
    s.replace(',', ".").parse::<f64>()
}
