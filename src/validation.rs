//! Module for data validation logic.
//!
//! Turns wide timestamped rows into long-form readings. Every channel cell
//! yields at most one [`CellOutcome`]; problems are collected, never raised.

use crate::config::{ChannelRule, PipelineConfig};
use crate::data_models::{
    ChannelValue, NormalizedReading, RejectReason, TimestampedRecord, ValidationError,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Result of examining one cell (or one whole row, for required-field failures).
#[derive(Debug, Clone, PartialEq)]
pub enum CellOutcome {
    Reading(NormalizedReading),
    Rejected(ValidationError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub valid: Vec<NormalizedReading>,
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Validator<'a> {
    config: &'a PipelineConfig,
    rules: Vec<ChannelRule>,
    file_name: &'a str,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a PipelineConfig, file_name: &'a str) -> Self {
        Self {
            config,
            rules: config.channel_rules(),
            file_name,
        }
    }

    /// Validate every row of one file.
    pub fn validate(&self, records: &[TimestampedRecord]) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        let mut seen: HashSet<(String, DateTime<Utc>, String)> = HashSet::new();

        for record in records {
            for cell in self.validate_row(record) {
                match cell {
                    CellOutcome::Reading(reading) => {
                        let identity = (
                            reading.sensor_id.clone(),
                            reading.ts,
                            reading.reading_type.clone(),
                        );
                        if seen.insert(identity) {
                            outcome.valid.push(reading);
                        } else {
                            outcome.errors.push(self.reject(
                                record.raw.line,
                                Some(reading.reading_type),
                                RejectReason::DuplicateReading,
                                Some(format!("another row already has a reading at {}", reading.ts)),
                            ));
                        }
                    }
                    CellOutcome::Rejected(error) => outcome.errors.push(error),
                }
            }
        }
        outcome
    }

    /// Reshape one wide row into per-channel outcomes.
    pub fn validate_row(&self, record: &TimestampedRecord) -> Vec<CellOutcome> {
        let raw = &record.raw;

        let ts = match &record.ts {
            Ok(ts) => *ts,
            Err(e) => {
                return vec![CellOutcome::Rejected(self.reject(
                    raw.line,
                    None,
                    RejectReason::MissingRequiredField,
                    Some(format!("ts: {}", e)),
                ))];
            }
        };

        let sensor_id = match raw.sensor_id.as_deref() {
            None => self.config.default_sensor_id.clone(),
            Some("") => {
                return vec![CellOutcome::Rejected(self.reject(
                    raw.line,
                    None,
                    RejectReason::MissingRequiredField,
                    Some("sensor_id is empty".to_string()),
                ))];
            }
            Some(id) => id.to_string(),
        };

        let location = match raw.location.as_deref() {
            None => Some(self.config.default_location.clone()),
            Some("") => None,
            Some(loc) => Some(loc.to_string()),
        };

        raw.channels
            .iter()
            .filter_map(|(name, value)| {
                self.validate_cell(raw.line, name, value)
                    .map(|checked| match checked {
                        Ok((reading_type, unit, reading_value)) => {
                            CellOutcome::Reading(NormalizedReading {
                                sensor_id: sensor_id.clone(),
                                ts,
                                source: self.config.source_name.clone(),
                                location: location.clone(),
                                reading_type,
                                reading_value,
                                unit,
                                file_name: self.file_name.to_string(),
                            })
                        }
                        Err(error) => CellOutcome::Rejected(error),
                    })
            })
            .collect()
    }

    /// `None` for absent values, which are neither readings nor errors.
    fn validate_cell(
        &self,
        line: u64,
        channel: &str,
        value: &ChannelValue,
    ) -> Option<Result<(String, Option<String>, f64), ValidationError>> {
        let rule = self.rules.iter().find(|r| r.matches(channel));
        let reading_type = rule
            .map(|r| r.reading_type.to_string())
            .unwrap_or_else(|| channel.to_string());

        let number = match value {
            ChannelValue::Missing => return None,
            ChannelValue::Text(text) => {
                return Some(Err(self.reject(
                    line,
                    Some(reading_type),
                    RejectReason::MalformedValue,
                    Some(format!("'{}' is not a number", text)),
                )));
            }
            ChannelValue::Number(n) if !n.is_finite() => {
                return Some(Err(self.reject(
                    line,
                    Some(reading_type),
                    RejectReason::MalformedValue,
                    Some(format!("{} is not a finite number", n)),
                )));
            }
            ChannelValue::Number(n) => *n,
        };

        match rule {
            Some(rule) if !rule.in_range(number) => Some(Err(self.reject(
                line,
                Some(reading_type),
                RejectReason::OutOfRange,
                Some(format!("{} outside [{}, {}]", number, rule.min, rule.max)),
            ))),
            Some(rule) => Some(Ok((reading_type, Some(rule.unit.to_string()), number))),
            None => Some(Ok((reading_type, None, number))),
        }
    }

    fn reject(
        &self,
        line: u64,
        reading_type: Option<String>,
        reason: RejectReason,
        detail: Option<String>,
    ) -> ValidationError {
        ValidationError {
            file_name: self.file_name.to_string(),
            row_reference: line,
            reading_type,
            error_reason: reason,
            detail,
        }
    }
}

/// Validate and reshape all rows of `file_name`.
pub fn validate_transform(
    records: &[TimestampedRecord],
    config: &PipelineConfig,
    file_name: &str,
) -> ValidationOutcome {
    Validator::new(config, file_name).validate(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_models::RawRecord;
    use crate::timestamp::timestamp_records;

    fn row(line: u64, time: &str, channels: &[(&str, ChannelValue)]) -> RawRecord {
        RawRecord {
            line,
            date: Some("10/03/2004".into()),
            time: Some(time.into()),
            sensor_id: None,
            location: None,
            channels: channels
                .iter()
                .map(|(n, v)| (n.to_string(), v.clone()))
                .collect(),
        }
    }

    fn run(rows: Vec<RawRecord>) -> ValidationOutcome {
        let config = PipelineConfig::default();
        validate_transform(&timestamp_records(rows), &config, "AirQuality.csv")
    }

    #[test]
    fn test_wide_row_becomes_long_readings() {
        let outcome = run(vec![row(
            2,
            "18.00.00",
            &[
                ("CO(GT)", ChannelValue::Number(2.6)),
                ("T", ChannelValue::Number(13.6)),
                ("RH", ChannelValue::Number(48.9)),
            ],
        )]);
        assert!(outcome.is_clean());
        assert_eq!(outcome.valid.len(), 3);

        let temp = &outcome.valid[1];
        assert_eq!(temp.reading_type, "temperature (C)");
        assert_eq!(temp.unit.as_deref(), Some("C"));
        assert_eq!(temp.sensor_id, "Station_1");
        assert_eq!(temp.location.as_deref(), Some("Milan_AirQuality"));
        assert_eq!(temp.source, "kaggle/airquality");
        assert_eq!(temp.file_name, "AirQuality.csv");

        let rh = &outcome.valid[2];
        assert_eq!(rh.reading_type, "humidity (%)");
        assert_eq!(rh.unit.as_deref(), Some("%"));
    }

    #[test]
    fn test_unknown_channel_passes_through_without_range_check() {
        let outcome = run(vec![row(2, "18.00.00", &[("PT08.S1(CO)", ChannelValue::Number(99999.0))])]);
        assert!(outcome.is_clean());
        assert_eq!(outcome.valid[0].reading_type, "PT08.S1(CO)");
        assert_eq!(outcome.valid[0].unit, None);
        assert_eq!(outcome.valid[0].reading_value, 99999.0);
    }

    #[test]
    fn test_out_of_range_temperature_is_rejected() {
        let outcome = run(vec![row(
            7,
            "18.00.00",
            &[("T", ChannelValue::Number(200.0)), ("RH", ChannelValue::Number(50.0))],
        )]);
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].reading_type, "humidity (%)");
        assert_eq!(outcome.errors.len(), 1);
        let err = &outcome.errors[0];
        assert_eq!(err.error_reason, RejectReason::OutOfRange);
        assert_eq!(err.error_reason.as_str(), "value out of range");
        assert_eq!(err.reading_type.as_deref(), Some("temperature (C)"));
        assert_eq!(err.row_reference, 7);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let outcome = run(vec![row(
            2,
            "18.00.00",
            &[("T", ChannelValue::Number(-50.0)), ("RH", ChannelValue::Number(100.0))],
        )]);
        assert!(outcome.is_clean());
        assert_eq!(outcome.valid.len(), 2);
    }

    #[test]
    fn test_missing_values_produce_nothing() {
        let outcome = run(vec![row(
            2,
            "18.00.00",
            &[("CO(GT)", ChannelValue::Missing), ("T", ChannelValue::Missing)],
        )]);
        assert!(outcome.valid.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_bad_timestamp_rejects_whole_row_once() {
        let outcome = run(vec![
            row(2, "18:00:00", &[("T", ChannelValue::Number(10.0)), ("RH", ChannelValue::Number(10.0))]),
            row(3, "19.00.00", &[("T", ChannelValue::Number(11.0))]),
        ]);
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].error_reason, RejectReason::MissingRequiredField);
        assert_eq!(outcome.errors[0].reading_type, None);
        assert!(outcome.errors[0].detail.as_deref().unwrap_or("").contains("18:00:00"));
    }

    #[test]
    fn test_empty_sensor_id_cell_is_missing_required_field() {
        let mut bad = row(2, "18.00.00", &[("T", ChannelValue::Number(10.0))]);
        bad.sensor_id = Some(String::new());
        let mut good = row(3, "18.00.00", &[("T", ChannelValue::Number(10.0))]);
        good.sensor_id = Some("S-9".into());
        good.location = Some(String::new());

        let outcome = run(vec![bad, good]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].error_reason, RejectReason::MissingRequiredField);
        assert_eq!(outcome.valid[0].sensor_id, "S-9");
        assert_eq!(outcome.valid[0].location, None);
    }

    #[test]
    fn test_text_and_non_finite_values_are_malformed() {
        let outcome = run(vec![row(
            2,
            "18.00.00",
            &[
                ("T", ChannelValue::Text("warm".into())),
                ("NOx(GT)", ChannelValue::Number(f64::NAN)),
            ],
        )]);
        assert!(outcome.valid.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.error_reason == RejectReason::MalformedValue));
        assert_eq!(outcome.errors[1].reading_type.as_deref(), Some("NOx(GT)"));
    }

    #[test]
    fn test_repeated_identity_is_a_duplicate() {
        let outcome = run(vec![
            row(2, "18.00.00", &[("T", ChannelValue::Number(10.0))]),
            row(3, "18.00.00", &[("T", ChannelValue::Number(12.0))]),
        ]);
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].reading_value, 10.0);
        assert_eq!(outcome.errors[0].error_reason, RejectReason::DuplicateReading);
        assert_eq!(outcome.errors[0].row_reference, 3);
    }
}
