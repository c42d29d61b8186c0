use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::data_models::{RawRecord, TimestampedRecord};
use crate::errors::TimestampError;

/// `day/month/year hour.minute.second`, date and time joined by one space.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H.%M.%S";

/// Combine a date field and a time field into a UTC instant.
///
/// The format is fixed; there is no auto-detection and no local timezone.
pub fn build_timestamp(date: &str, time: &str) -> Result<DateTime<Utc>, TimestampError> {
    let datetime_str = format!("{} {}", date.trim(), time.trim());
    NaiveDateTime::parse_from_str(&datetime_str, TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| TimestampError {
            value: datetime_str,
            format: TIMESTAMP_FORMAT.to_string(),
            message: e.to_string(),
        })
}

/// Attach a timestamp (or the reason there is none) to every record.
pub fn timestamp_records(records: Vec<RawRecord>) -> Vec<TimestampedRecord> {
    records
        .into_iter()
        .map(|raw| {
            let ts = match (raw.date.as_deref(), raw.time.as_deref()) {
                (Some(date), Some(time)) => build_timestamp(date, time),
                (date, time) => Err(TimestampError {
                    value: format!("{} {}", date.unwrap_or(""), time.unwrap_or(""))
                        .trim()
                        .to_string(),
                    format: TIMESTAMP_FORMAT.to_string(),
                    message: "date or time field is empty".to_string(),
                }),
            };
            TimestampedRecord { raw, ts }
        })
        .collect()
}
