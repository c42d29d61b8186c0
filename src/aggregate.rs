//! Per-file, per-reading-type summary statistics.

use crate::data_models::{FileAggregate, NormalizedReading};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

struct Group {
    values: Vec<f64>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

/// Compute one aggregate per distinct reading type present in `readings`.
///
/// Output is ordered by reading type. Values are summed in ascending order so
/// the result does not depend on row order.
pub fn compute_aggregates(
    readings: &[NormalizedReading],
    file_name: &str,
    source: &str,
    computed_at: DateTime<Utc>,
) -> Vec<FileAggregate> {
    let mut groups: BTreeMap<&str, Group> = BTreeMap::new();

    for reading in readings {
        groups
            .entry(reading.reading_type.as_str())
            .and_modify(|g| {
                g.values.push(reading.reading_value);
                g.window_start = g.window_start.min(reading.ts);
                g.window_end = g.window_end.max(reading.ts);
            })
            .or_insert_with(|| Group {
                values: vec![reading.reading_value],
                window_start: reading.ts,
                window_end: reading.ts,
            });
    }

    groups
        .into_iter()
        .map(|(reading_type, mut group)| {
            group.values.sort_by(f64::total_cmp);
            let stats = Stats::of(&group.values);
            FileAggregate {
                file_name: file_name.to_string(),
                source: source.to_string(),
                reading_type: reading_type.to_string(),
                count: group.values.len() as i64,
                min_value: stats.min,
                max_value: stats.max,
                avg_value: stats.mean,
                stddev_value: stats.stddev,
                window_start: group.window_start,
                window_end: group.window_end,
                computed_at,
            }
        })
        .collect()
}

struct Stats {
    min: f64,
    max: f64,
    mean: f64,
    stddev: Option<f64>,
}

impl Stats {
    // `sorted` is non-empty and ascending
    fn of(sorted: &[f64]) -> Self {
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let stddev = if sorted.len() > 1 {
            let mut squares: Vec<f64> = sorted.iter().map(|v| (v - mean).powi(2)).collect();
            squares.sort_by(f64::total_cmp);
            Some((squares.iter().sum::<f64>() / (n - 1.0)).sqrt())
        } else {
            None
        };
        Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reading(reading_type: &str, value: f64, hour: u32) -> NormalizedReading {
        NormalizedReading {
            sensor_id: "Station_1".into(),
            ts: Utc.with_ymd_and_hms(2004, 3, 10, hour, 0, 0).unwrap(),
            source: "kaggle/airquality".into(),
            location: None,
            reading_type: reading_type.into(),
            reading_value: value,
            unit: None,
            file_name: "AirQuality.csv".into(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_sample_statistics() {
        let readings = vec![
            reading("temperature (C)", 10.0, 18),
            reading("temperature (C)", 20.0, 19),
            reading("temperature (C)", 30.0, 20),
        ];
        let aggs = compute_aggregates(&readings, "AirQuality.csv", "kaggle/airquality", now());
        assert_eq!(aggs.len(), 1);
        let agg = &aggs[0];
        assert_eq!(agg.count, 3);
        assert_eq!(agg.min_value, 10.0);
        assert_eq!(agg.max_value, 30.0);
        assert_eq!(agg.avg_value, 20.0);
        assert_eq!(agg.stddev_value, Some(10.0));
        assert_eq!(agg.window_start, readings[0].ts);
        assert_eq!(agg.window_end, readings[2].ts);
        assert_eq!(agg.computed_at, now());
    }

    #[test]
    fn test_single_reading_has_no_stddev() {
        let aggs = compute_aggregates(&[reading("CO(GT)", 2.6, 18)], "f.csv", "s", now());
        assert_eq!(aggs[0].count, 1);
        assert_eq!(aggs[0].stddev_value, None);
        assert_eq!(aggs[0].window_start, aggs[0].window_end);
    }

    #[test]
    fn test_windows_are_per_reading_type() {
        let readings = vec![
            reading("humidity (%)", 40.0, 18),
            reading("temperature (C)", 12.0, 20),
            reading("humidity (%)", 42.0, 21),
        ];
        let aggs = compute_aggregates(&readings, "f.csv", "s", now());
        let types: Vec<&str> = aggs.iter().map(|a| a.reading_type.as_str()).collect();
        assert_eq!(types, vec!["humidity (%)", "temperature (C)"]);
        assert_eq!(aggs[0].window_end - aggs[0].window_start, Duration::hours(3));
        assert_eq!(aggs[1].window_start, aggs[1].window_end);
    }

    #[test]
    fn test_result_is_independent_of_row_order() {
        let mut readings: Vec<NormalizedReading> = [0.1, 0.7, 1e9, 0.2, -3.3, 0.3]
            .iter()
            .enumerate()
            .map(|(i, v)| reading("CO(GT)", *v, i as u32))
            .collect();
        let forward = compute_aggregates(&readings, "f.csv", "s", now());
        readings.reverse();
        let backward = compute_aggregates(&readings, "f.csv", "s", now());
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_empty_input_has_no_aggregates() {
        assert!(compute_aggregates(&[], "f.csv", "s", now()).is_empty());
    }
}
