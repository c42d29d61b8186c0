use crate::pipeline::FileOutcome;
use crate::router::FileDisposition;
use log::{debug, info};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pipeline metrics tracker for one sweep or polling session.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub total_files_attempted: u64,
    pub total_files_processed: u64,
    pub total_files_quarantined: u64,
    pub total_route_failures: u64,
    pub total_readings_valid: u64,
    pub total_validation_errors: u64,
    pub total_readings_inserted: u64,
    pub total_readings_ignored: u64,
    pub total_aggregates_upserted: u64,
    pub processing_times: HashMap<String, Duration>,
    pub start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_file_attempt(&mut self) {
        self.total_files_attempted += 1;
    }

    pub fn record_outcome(&mut self, outcome: &FileOutcome) {
        match outcome.disposition {
            FileDisposition::Processed => self.total_files_processed += 1,
            FileDisposition::Quarantined => self.total_files_quarantined += 1,
        }
        self.total_readings_valid += outcome.readings_valid as u64;
        self.total_validation_errors += outcome.validation_errors as u64;
        if let Some(write) = outcome.write {
            self.total_readings_inserted += write.readings_inserted;
            self.total_readings_ignored += write.readings_ignored;
            self.total_aggregates_upserted += write.aggregates_upserted;
        }
        self.processing_times
            .insert(outcome.file_name.clone(), outcome.elapsed);
    }

    pub fn record_route_failure(&mut self) {
        self.total_route_failures += 1;
    }

    /// Files that reached a terminal location.
    pub fn files_routed(&self) -> u64 {
        self.total_files_processed + self.total_files_quarantined
    }

    pub fn get_total_duration(&self) -> Duration {
        self.start_time
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn get_throughput(&self) -> f64 {
        let duration_secs = self.get_total_duration().as_secs_f64();
        if duration_secs > 0.0 {
            self.total_readings_valid as f64 / duration_secs
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        info!("========== Pipeline Metrics Summary ==========");
        info!("Total Duration: {:.2?}", self.get_total_duration());
        info!("Files Attempted: {}", self.total_files_attempted);
        info!("Files Processed: {}", self.total_files_processed);
        info!("Files Quarantined: {}", self.total_files_quarantined);
        info!("Route Failures: {}", self.total_route_failures);
        info!("Valid Readings: {}", self.total_readings_valid);
        info!("Validation Errors: {}", self.total_validation_errors);
        info!(
            "Readings Inserted: {} (ignored as duplicates: {})",
            self.total_readings_inserted, self.total_readings_ignored
        );
        info!("Aggregates Upserted: {}", self.total_aggregates_upserted);
        info!("Throughput: {:.2} readings/sec", self.get_throughput());

        let mut times: Vec<_> = self.processing_times.iter().collect();
        times.sort();
        for (file, duration) in times {
            debug!("  {}: {:.2?}", file, duration);
        }
        info!("=============================================");
    }
}
