//! Intake discovery and the sequential worker loop.

use crate::errors::PipelineError;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::router::done_marker_path;
use crate::store::ReadingStore;
use glob::{glob, Pattern};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::time::sleep;

/// Candidate `*.csv` files directly under `incoming`, in lexicographic order.
///
/// Zero-byte files, files with a `.done` marker and paths in `seen` are left out.
pub fn discover(incoming: &Path, seen: &HashSet<PathBuf>) -> Result<Vec<PathBuf>, PipelineError> {
    let pattern = format!(
        "{}/*.csv",
        Pattern::escape(&incoming.to_string_lossy())
    );
    let mut files = Vec::new();
    for entry in glob(&pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping unreadable intake entry: {}", e);
                continue;
            }
        };
        if seen.contains(&path) || done_marker_path(&path).exists() {
            continue;
        }
        match path.metadata() {
            Ok(meta) if meta.is_file() && meta.len() > 0 => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Could not stat {}: {}", path.display(), e),
        }
    }
    files.sort();
    Ok(files)
}

/// Single sequential worker over the intake area.
pub struct Scanner<S> {
    pipeline: Pipeline<S>,
    seen: HashSet<PathBuf>,
    shutdown: watch::Receiver<bool>,
    show_progress: bool,
}

impl<S: ReadingStore> Scanner<S> {
    /// `shutdown` flips to `true` when the worker should stop after the current file.
    pub fn new(pipeline: Pipeline<S>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pipeline,
            seen: HashSet::new(),
            shutdown,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn pipeline(&self) -> &Pipeline<S> {
        &self.pipeline
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Process every file currently in the intake area, then return.
    pub async fn run_once(&mut self) -> Result<Metrics, PipelineError> {
        let mut metrics = Metrics::new();
        // A name that left intake may arrive again as a new file.
        self.seen.retain(|path| path.exists());
        let files = discover(&self.pipeline.config().layout.incoming, &self.seen)?;
        if files.is_empty() {
            debug!("No new files in intake");
            return Ok(metrics);
        }
        info!("Found {} file(s) to process", files.len());

        let progress = ProgressBar::with_draw_target(
            Some(files.len() as u64),
            if self.show_progress {
                ProgressDrawTarget::stderr()
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        for path in files {
            if self.stop_requested() {
                info!("Stop requested; leaving remaining files for the next run");
                break;
            }
            progress.set_message(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );

            self.seen.insert(path.clone());
            metrics.record_file_attempt();
            match self.pipeline.process_file(&path).await {
                Ok(outcome) => metrics.record_outcome(&outcome),
                Err(e) => {
                    error!("Failed to route {}: {}", path.display(), e);
                    metrics.record_route_failure();
                }
            }
            progress.inc(1);
        }

        progress.finish_with_message("sweep complete");
        metrics.log_summary();
        Ok(metrics)
    }

    /// Sweep the intake area every `poll_interval` until a stop is requested.
    pub async fn run_polling(&mut self) -> Result<(), PipelineError> {
        let interval = self.pipeline.config().poll_interval;
        info!(
            "Watching {} every {:?}",
            self.pipeline.config().layout.incoming.display(),
            interval
        );
        while !self.stop_requested() {
            let metrics = self.run_once().await?;
            if metrics.files_routed() > 0 {
                continue;
            }
            tokio::select! {
                _ = sleep(interval) => {}
                changed = self.shutdown.changed() => {
                    // Nobody can signal a stop any more; keep the cadence.
                    if changed.is_err() {
                        sleep(interval).await;
                    }
                }
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}
