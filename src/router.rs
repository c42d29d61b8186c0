//! File disposition: decide where a file ends up, then put it there.

use crate::config::DataLayout;
use crate::data_models::ValidationError;
use crate::errors::{PersistenceError, RouteError};
use log::{debug, error, warn};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const ERRORS_ARTIFACT_SUFFIX: &str = "__errors.csv";
pub const FATAL_ARTIFACT_SUFFIX: &str = "__fatal.txt";
pub const DONE_MARKER_EXTENSION: &str = "done";

/// Lifecycle of one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Received,
    Loaded,
    Validated,
    Persisted,
    Processed,
    Quarantined,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileState::Received => "received",
            FileState::Loaded => "loaded",
            FileState::Validated => "validated",
            FileState::Persisted => "persisted",
            FileState::Processed => "processed",
            FileState::Quarantined => "quarantined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDisposition {
    Processed,
    Quarantined,
}

impl FileDisposition {
    pub fn terminal_state(self) -> FileState {
        match self {
            FileDisposition::Processed => FileState::Processed,
            FileDisposition::Quarantined => FileState::Quarantined,
        }
    }
}

/// Diagnostic written beside a quarantined file.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// One row per rejected row or field.
    Errors(Vec<ValidationError>),
    /// Free-text description of a file-level failure.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub disposition: FileDisposition,
    pub artifact: Option<Artifact>,
}

impl Verdict {
    pub fn processed() -> Self {
        Self {
            disposition: FileDisposition::Processed,
            artifact: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            disposition: FileDisposition::Quarantined,
            artifact: Some(Artifact::Fatal(reason.into())),
        }
    }

    pub fn errors(errors: Vec<ValidationError>) -> Self {
        Self {
            disposition: FileDisposition::Quarantined,
            artifact: Some(Artifact::Errors(errors)),
        }
    }
}

/// Disposition after validation and, when there was something to write, persistence.
///
/// A persistence failure wins over row errors, row errors win over an empty
/// result, and only a clean file with at least one stored reading is processed.
pub fn decide(
    valid_readings: usize,
    errors: Vec<ValidationError>,
    persistence_failure: Option<&PersistenceError>,
) -> Verdict {
    if let Some(failure) = persistence_failure {
        let mut reason = format!("persistence failed: {}", failure);
        if !errors.is_empty() {
            reason.push_str(&format!(
                "\n{} row-level validation error(s) were also recorded",
                errors.len()
            ));
        }
        return Verdict::fatal(reason);
    }
    if !errors.is_empty() {
        return Verdict::errors(errors);
    }
    if valid_readings == 0 {
        return Verdict::fatal("no valid readings were produced");
    }
    Verdict::processed()
}

/// Moves or copies source files into the processed and quarantine areas.
#[derive(Debug, Clone)]
pub struct Router {
    layout: DataLayout,
    keep_incoming: bool,
}

impl Router {
    pub fn new(layout: DataLayout, keep_incoming: bool) -> Self {
        Self {
            layout,
            keep_incoming,
        }
    }

    pub fn destination_dir(&self, disposition: FileDisposition) -> &Path {
        match disposition {
            FileDisposition::Processed => &self.layout.processed,
            FileDisposition::Quarantined => &self.layout.quarantine,
        }
    }

    /// Put `source` in its destination area and write its artifact, if any.
    ///
    /// Nothing is moved when the file or its artifact would clobber an
    /// existing file. Returns the new location of the file.
    pub fn route(&self, source: &Path, verdict: &Verdict) -> Result<PathBuf, RouteError> {
        let file_name = source.file_name().ok_or_else(|| RouteError::Io {
            path: source.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let dir = self.destination_dir(verdict.disposition);
        let destination = dir.join(file_name);
        let artifact_path = verdict
            .artifact
            .as_ref()
            .map(|artifact| artifact_path(dir, source, artifact));

        for path in std::iter::once(&destination).chain(artifact_path.as_ref()) {
            if path.exists() {
                return Err(RouteError::DestinationExists { path: path.clone() });
            }
        }

        // Artifact first; it is removed again if the file cannot be placed.
        if let (Some(artifact), Some(path)) = (&verdict.artifact, &artifact_path) {
            write_artifact(path, artifact)?;
        }

        if let Err(e) = self.place(source, &destination) {
            if let Some(path) = &artifact_path {
                if let Err(cleanup) = fs::remove_file(path) {
                    error!(
                        "Could not remove artifact {} after failed route: {}",
                        path.display(),
                        cleanup
                    );
                }
            }
            return Err(e);
        }
        debug!("{} -> {}", source.display(), destination.display());

        if let Some(path) = &artifact_path {
            warn!(
                "Quarantined {} with {}",
                destination.display(),
                path.display()
            );
        }
        Ok(destination)
    }

    fn place(&self, source: &Path, destination: &Path) -> Result<(), RouteError> {
        if self.keep_incoming {
            copy_file(source, destination)?;
            write_done_marker(source)
        } else {
            move_file(source, destination)
        }
    }
}

pub fn artifact_path(dir: &Path, source: &Path, artifact: &Artifact) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = match artifact {
        Artifact::Errors(_) => ERRORS_ARTIFACT_SUFFIX,
        Artifact::Fatal(_) => FATAL_ARTIFACT_SUFFIX,
    };
    dir.join(format!("{}{}", stem, suffix))
}

/// `<file>.done` beside `source` in the intake area.
pub fn done_marker_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".");
    name.push(DONE_MARKER_EXTENSION);
    PathBuf::from(name)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RouteError + '_ {
    move |source| RouteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(destination: &Path) -> Result<(), RouteError> {
    match destination.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(io_error(parent)),
        None => Ok(()),
    }
}

/// Move `source` to `destination`, failing if `destination` already exists.
pub fn move_file(source: &Path, destination: &Path) -> Result<(), RouteError> {
    ensure_parent(destination)?;
    // A hard link fails atomically on an existing target, unlike rename.
    match fs::hard_link(source, destination) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(RouteError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        // Cross-device or no link support.
        Err(e) => {
            debug!(
                "hard link {} failed ({}), falling back to copy",
                destination.display(),
                e
            );
            copy_file(source, destination)?;
        }
    }
    fs::remove_file(source).map_err(io_error(source))
}

/// Copy `source` to `destination`, failing if `destination` already exists.
pub fn copy_file(source: &Path, destination: &Path) -> Result<(), RouteError> {
    ensure_parent(destination)?;
    let mut input = File::open(source).map_err(io_error(source))?;
    let mut output = create_new(destination)?;
    io::copy(&mut input, &mut output).map_err(io_error(destination))?;
    output.sync_all().map_err(io_error(destination))
}

fn create_new(path: &Path) -> Result<File, RouteError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                RouteError::DestinationExists {
                    path: path.to_path_buf(),
                }
            } else {
                RouteError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
}

fn write_done_marker(source: &Path) -> Result<(), RouteError> {
    let marker = done_marker_path(source);
    File::create(&marker).map_err(io_error(&marker))?;
    Ok(())
}

pub fn write_artifact(path: &Path, artifact: &Artifact) -> Result<(), RouteError> {
    ensure_parent(path)?;
    match artifact {
        Artifact::Errors(errors) => write_errors_artifact(path, errors),
        Artifact::Fatal(reason) => write_fatal_artifact(path, reason),
    }
}

fn write_errors_artifact(path: &Path, errors: &[ValidationError]) -> Result<(), RouteError> {
    let file = create_new(path)?;
    let mut writer = csv::Writer::from_writer(file);
    let artifact_error = |source| RouteError::Artifact {
        path: path.to_path_buf(),
        source,
    };
    for error in errors {
        writer.serialize(error).map_err(artifact_error)?;
    }
    writer.flush().map_err(io_error(path))
}

fn write_fatal_artifact(path: &Path, reason: &str) -> Result<(), RouteError> {
    let mut file = create_new(path)?;
    writeln!(file, "{}", reason).map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_models::RejectReason;
    use crate::errors::StoreError;
    use tempfile::TempDir;

    fn rejected(line: u64) -> ValidationError {
        ValidationError {
            file_name: "AirQuality.csv".into(),
            row_reference: line,
            reading_type: Some("temperature (C)".into()),
            error_reason: RejectReason::OutOfRange,
            detail: Some("200 outside [-50, 50]".into()),
        }
    }

    fn setup(keep_incoming: bool) -> (TempDir, Router, PathBuf) {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::from_data_dir(dir.path());
        layout.ensure().unwrap();
        let source = layout.incoming.join("AirQuality.csv");
        fs::write(&source, "Date;Time;T\n").unwrap();
        (dir, Router::new(layout, keep_incoming), source)
    }

    #[test]
    fn test_decide_clean_file_is_processed() {
        assert_eq!(decide(3, vec![], None), Verdict::processed());
    }

    #[test]
    fn test_decide_any_row_error_quarantines() {
        let verdict = decide(5, vec![rejected(4)], None);
        assert_eq!(verdict.disposition, FileDisposition::Quarantined);
        assert_eq!(verdict.artifact, Some(Artifact::Errors(vec![rejected(4)])));
    }

    #[test]
    fn test_decide_nothing_valid_and_nothing_rejected_is_fatal() {
        let verdict = decide(0, vec![], None);
        assert!(matches!(verdict.artifact, Some(Artifact::Fatal(ref r)) if r.contains("no valid readings")));
    }

    #[test]
    fn test_decide_persistence_failure_is_fatal() {
        let failure = PersistenceError::TransientExhausted {
            attempts: 5,
            last: StoreError::Transient("connection refused".into()),
        };
        let verdict = decide(10, vec![rejected(2)], Some(&failure));
        assert_eq!(verdict.disposition, FileDisposition::Quarantined);
        match verdict.artifact {
            Some(Artifact::Fatal(reason)) => {
                assert!(reason.contains("connection refused"));
                assert!(reason.contains("1 row-level validation error"));
            }
            other => panic!("expected fatal artifact, got {:?}", other),
        }
    }

    #[test]
    fn test_route_processed_moves_without_artifact() {
        let (_dir, router, source) = setup(false);
        let dest = router.route(&source, &Verdict::processed()).unwrap();
        assert!(!source.exists());
        assert!(dest.exists());
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_route_writes_errors_artifact() {
        let (_dir, router, source) = setup(false);
        let dest = router
            .route(&source, &Verdict::errors(vec![rejected(3), rejected(9)]))
            .unwrap();
        let artifact = dest.with_file_name("AirQuality__errors.csv");
        let text = fs::read_to_string(artifact).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("file_name,row_reference,reading_type,error_reason,detail")
        );
        assert_eq!(
            lines.next(),
            Some("AirQuality.csv,3,temperature (C),value out of range,\"200 outside [-50, 50]\"")
        );
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_route_writes_fatal_artifact() {
        let (_dir, router, source) = setup(false);
        let dest = router.route(&source, &Verdict::fatal("load failed: bad")).unwrap();
        let text = fs::read_to_string(dest.with_file_name("AirQuality__fatal.txt")).unwrap();
        assert_eq!(text, "load failed: bad\n");
    }

    #[test]
    fn test_route_refuses_to_overwrite() {
        let (_dir, router, source) = setup(false);
        let existing = router.destination_dir(FileDisposition::Processed).join("AirQuality.csv");
        fs::write(&existing, "older").unwrap();

        let err = router.route(&source, &Verdict::processed()).unwrap_err();
        assert!(matches!(err, RouteError::DestinationExists { ref path } if *path == existing));
        assert!(source.exists());
        assert_eq!(fs::read_to_string(existing).unwrap(), "older");
    }

    #[test]
    fn test_route_refuses_when_artifact_exists() {
        let (_dir, router, source) = setup(false);
        let quarantine = router.destination_dir(FileDisposition::Quarantined);
        fs::write(quarantine.join("AirQuality__fatal.txt"), "earlier").unwrap();

        let err = router.route(&source, &Verdict::fatal("again")).unwrap_err();
        assert!(matches!(err, RouteError::DestinationExists { .. }));
        assert!(source.exists());
        assert!(!quarantine.join("AirQuality.csv").exists());
    }

    #[test]
    fn test_failed_move_leaves_no_orphan_artifact() {
        let (_dir, router, source) = setup(false);
        fs::remove_file(&source).unwrap();

        let err = router.route(&source, &Verdict::fatal("load failed: gone")).unwrap_err();
        assert!(matches!(err, RouteError::Io { .. }));
        let quarantine = router.destination_dir(FileDisposition::Quarantined);
        assert_eq!(fs::read_dir(quarantine).unwrap().count(), 0);
    }

    #[test]
    fn test_move_creates_missing_directories() {
        let (dir, _router, source) = setup(false);
        let destination = dir.path().join("nested/deeper/AirQuality.csv");
        move_file(&source, &destination).unwrap();
        assert!(destination.exists());
        assert!(!source.exists());
    }

    #[test]
    fn test_keep_incoming_copies_and_marks() {
        let (_dir, router, source) = setup(true);
        let dest = router.route(&source, &Verdict::processed()).unwrap();
        assert!(source.exists());
        assert!(dest.exists());
        assert!(done_marker_path(&source).exists());
        assert!(done_marker_path(&source).to_string_lossy().ends_with("AirQuality.csv.done"));
    }
}
