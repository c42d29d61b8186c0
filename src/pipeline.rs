//! Per-file orchestration: load, timestamp, validate, aggregate, persist, route.

use crate::aggregate::compute_aggregates;
use crate::config::PipelineConfig;
use crate::data_models::FileBatch;
use crate::errors::RouteError;
use crate::parsers::{load_file, LoaderConvention};
use crate::router::{self, FileDisposition, FileState, Router, Verdict};
use crate::store::{persist_file, ReadingStore, WriteSummary};
use crate::timestamp::timestamp_records;
use crate::validation::validate_transform;
use chrono::Utc;
use futures_util::FutureExt;
use log::{debug, info};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// What happened to one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub file_name: String,
    pub disposition: FileDisposition,
    pub destination: PathBuf,
    pub readings_valid: usize,
    pub validation_errors: usize,
    /// Present when a write reached the store and committed.
    pub write: Option<WriteSummary>,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Evaluation {
    verdict: Verdict,
    readings_valid: usize,
    validation_errors: usize,
    write: Option<WriteSummary>,
}

impl Evaluation {
    fn fatal(reason: String) -> Self {
        Self {
            verdict: Verdict::fatal(reason),
            readings_valid: 0,
            validation_errors: 0,
            write: None,
        }
    }
}

pub struct Pipeline<S> {
    config: PipelineConfig,
    convention: LoaderConvention,
    router: Router,
    store: S,
}

impl<S: ReadingStore> Pipeline<S> {
    pub fn new(config: PipelineConfig, store: S) -> Self {
        let convention = LoaderConvention::from_config(&config);
        let router = Router::new(config.layout.clone(), config.keep_incoming);
        Self {
            config,
            convention,
            router,
            store,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one file through every stage and route it.
    ///
    /// Every failure up to routing, panics included, becomes a quarantine
    /// verdict. Only a failure to move the file or write its artifact is
    /// returned as an error, with the file left in place.
    pub async fn process_file(&self, path: &Path) -> Result<FileOutcome, RouteError> {
        let started = Instant::now();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Processing file: {}", path.display());

        let evaluation = AssertUnwindSafe(self.evaluate(path, &file_name))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Evaluation::fatal(format!("unexpected failure: {}", panic_message(&*panic)))
            });

        let destination = self.router.route(path, &evaluation.verdict)?;
        let disposition = evaluation.verdict.disposition;
        debug!("{}: -> {}", file_name, disposition.terminal_state());

        let outcome = FileOutcome {
            file_name,
            disposition,
            destination,
            readings_valid: evaluation.readings_valid,
            validation_errors: evaluation.validation_errors,
            write: evaluation.write,
            elapsed: started.elapsed(),
        };
        info!(
            "Finished {}: {} ({} valid readings, {} validation errors) in {:.2?}",
            outcome.file_name,
            outcome.disposition.terminal_state(),
            outcome.readings_valid,
            outcome.validation_errors,
            outcome.elapsed
        );
        Ok(outcome)
    }

    async fn evaluate(&self, path: &Path, file_name: &str) -> Evaluation {
        let records = match load_file(path, &self.convention) {
            Ok(records) => records,
            Err(e) => return Evaluation::fatal(format!("load failed: {}", e)),
        };
        transition(file_name, FileState::Received, FileState::Loaded);

        let timestamped = timestamp_records(records);
        let outcome = validate_transform(&timestamped, &self.config, file_name);
        transition(file_name, FileState::Loaded, FileState::Validated);

        let readings_valid = outcome.valid.len();
        let validation_errors = outcome.errors.len();
        let mut write = None;
        let mut failure = None;

        if readings_valid > 0 {
            let aggregates = compute_aggregates(
                &outcome.valid,
                file_name,
                &self.config.source_name,
                Utc::now(),
            );
            let batch = FileBatch {
                file_name: file_name.to_string(),
                readings: outcome.valid,
                aggregates,
            };
            match persist_file(&self.store, &batch, &self.config.retry).await {
                Ok(summary) => {
                    transition(file_name, FileState::Validated, FileState::Persisted);
                    write = Some(summary);
                }
                Err(e) => failure = Some(e),
            }
        }

        Evaluation {
            verdict: router::decide(readings_valid, outcome.errors, failure.as_ref()),
            readings_valid,
            validation_errors,
            write,
        }
    }
}

fn transition(file_name: &str, from: FileState, to: FileState) {
    debug!("{}: {} -> {}", file_name, from, to);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::MemoryStore;
    use std::fs;
    use tempfile::TempDir;

    struct PanickingStore;

    impl ReadingStore for PanickingStore {
        async fn write_batch(&self, _batch: &FileBatch) -> Result<WriteSummary, StoreError> {
            panic!("driver bug");
        }
    }

    fn config_in(dir: &TempDir) -> PipelineConfig {
        let config = PipelineConfig {
            layout: crate::config::DataLayout::from_data_dir(dir.path()),
            ..PipelineConfig::default()
        };
        config.layout.ensure().unwrap();
        config
    }

    #[test]
    fn test_panic_message_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*literal), "boom");
        assert_eq!(panic_message(&*owned), "bang");
        assert_eq!(panic_message(&*other), "panic with non-string payload");
    }

    #[tokio::test]
    async fn test_panic_in_store_quarantines_file() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let source = config.layout.incoming.join("a.csv");
        fs::write(&source, "Date;Time;T\n10/03/2004;18.00.00;13,6\n").unwrap();

        let pipeline = Pipeline::new(config, PanickingStore);
        let outcome = pipeline.process_file(&source).await.unwrap();

        assert_eq!(outcome.disposition, FileDisposition::Quarantined);
        let fatal = fs::read_to_string(pipeline.config().layout.quarantine.join("a__fatal.txt")).unwrap();
        assert!(fatal.contains("driver bug"));
    }

    #[tokio::test]
    async fn test_clean_file_is_processed_and_stored() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let source = config.layout.incoming.join("b.csv");
        fs::write(&source, "Date;Time;T;RH\n10/03/2004;18.00.00;13,6;48,9\n").unwrap();

        let pipeline = Pipeline::new(config, MemoryStore::new());
        let outcome = pipeline.process_file(&source).await.unwrap();

        assert_eq!(outcome.disposition, FileDisposition::Processed);
        assert_eq!(outcome.readings_valid, 2);
        assert_eq!(outcome.write.map(|w| w.readings_inserted), Some(2));
        assert_eq!(pipeline.store().aggregates().len(), 2);
        assert!(outcome.destination.ends_with("processed/b.csv"));
    }
}
