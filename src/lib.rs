pub mod aggregate;
pub mod config;
pub mod data_models;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod parsers;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod scanner;
pub mod store;
pub mod timestamp;
pub mod validation;

pub use config::PipelineConfig;
pub use pipeline::{FileOutcome, Pipeline};
pub use scanner::Scanner;
pub use store::{MemoryStore, PgStore, ReadingStore};
