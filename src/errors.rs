use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::retry::{RetryError, Retryable};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config file {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse JSON configuration in {path}: {source}")]
    JsonParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Configuration file not found at {path}")]
    NotFound { path: PathBuf },
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// File-level failure: the source could not be read as tabular data at all.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error reading data file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Data file {path} is not valid UTF-8 (line {line})")]
    Encoding { path: PathBuf, line: u64 },
    #[error("Data file {path} could not be parsed as delimited text: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("Data file {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("Data file {path} contains no data rows")]
    NoRows { path: PathBuf },
}

impl LoadError {
    pub(crate) fn from_csv(path: PathBuf, err: csv::Error) -> Self {
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Utf8 { pos, .. } => LoadError::Encoding {
                path,
                line: pos.map(|p| p.line()).unwrap_or(0),
            },
            csv::ErrorKind::Io(source) => LoadError::Io { path, source },
            _ => LoadError::Malformed { path, message },
        }
    }
}

/// Row-level failure to build an instant from the date and time fields.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to parse timestamp '{value}' with format '{format}': {message}")]
pub struct TimestampError {
    pub value: String,
    pub format: String,
    pub message: String,
}

/// A single failed attempt against the relational store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("transient database failure: {0}")]
    Transient(String),
    #[error("permanent database failure: {0}")]
    Permanent(String),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub(crate) fn is_transient_state(state: &SqlState) -> bool {
    [
        SqlState::T_R_SERIALIZATION_FAILURE,
        SqlState::T_R_DEADLOCK_DETECTED,
        SqlState::CONNECTION_EXCEPTION,
        SqlState::CONNECTION_DOES_NOT_EXIST,
        SqlState::CONNECTION_FAILURE,
        SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION,
        SqlState::ADMIN_SHUTDOWN,
        SqlState::CRASH_SHUTDOWN,
        SqlState::CANNOT_CONNECT_NOW,
        SqlState::QUERY_CANCELED,
        SqlState::TOO_MANY_CONNECTIONS,
    ]
    .contains(state)
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        let transient = match err.code() {
            Some(state) => is_transient_state(state),
            // Without a SQLSTATE only a dropped or unreachable connection is worth
            // another attempt. Config, encoding and protocol errors are not.
            None => err.is_closed() || has_io_source(&err),
        };
        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Permanent(err.to_string())
        }
    }
}

/// Socket failures and connect timeouts surface as an `io::Error` source.
fn has_io_source(err: &tokio_postgres::Error) -> bool {
    std::error::Error::source(err).map_or(false, |source| source.is::<io::Error>())
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        use deadpool_postgres::PoolError;
        match err {
            PoolError::Timeout(kind) => {
                StoreError::Transient(format!("connection pool timeout ({:?})", kind))
            }
            PoolError::Backend(e) => StoreError::from(e),
            other => StoreError::Permanent(format!("connection pool error: {}", other)),
        }
    }
}

/// Terminal outcome of the persistence layer for one file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("gave up after {attempts} attempts on transient failure: {last}")]
    TransientExhausted { attempts: u32, last: StoreError },
    #[error("permanent persistence failure on attempt {attempt}: {error}")]
    Permanent { attempt: u32, error: StoreError },
}

impl PersistenceError {
    pub fn is_transient_exhausted(&self) -> bool {
        matches!(self, PersistenceError::TransientExhausted { .. })
    }
}

impl From<RetryError<StoreError>> for PersistenceError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, error } => PersistenceError::TransientExhausted {
                attempts,
                last: error,
            },
            RetryError::Permanent { attempt, error } => PersistenceError::Permanent { attempt, error },
        }
    }
}

/// Moving a file or writing its artifact failed.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Refusing to overwrite existing file {path}")]
    DestinationExists { path: PathBuf },
    #[error("IO error routing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write errors artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration loading failed: {0}")]
    Config(#[from] ConfigError),
    #[error("Database pool creation error: {0}")]
    DbPoolError(String),
    #[error("Database operation failed: {0}")]
    DbQueryError(#[from] tokio_postgres::Error),
    #[error("Failed to get database connection from pool: {0}")]
    DbConnectionError(#[from] deadpool_postgres::PoolError),
    #[error("Invalid discovery pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}
