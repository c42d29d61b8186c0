//! Persistence of per-file batches.
//!
//! A [`FileBatch`] is written as one unit: readings are insert-ignored by
//! `dedupe_key`, aggregates are upserted on `(file_name, reading_type)`, and
//! either everything commits or nothing does.

use crate::data_models::{FileAggregate, FileBatch, NormalizedReading};
use crate::db::DbPool;
use crate::errors::{PersistenceError, StoreError};
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Rows sent per UNNEST insert statement.
const INSERT_CHUNK_SIZE: usize = 5000;

pub const INSERT_READINGS_SQL: &str = "
INSERT INTO raw_readings
    (sensor_id, ts, source, location, reading_type, reading_value, unit, file_name, dedupe_key)
SELECT * FROM UNNEST(
    $1::text[], $2::timestamptz[], $3::text[], $4::text[], $5::text[],
    $6::float8[], $7::text[], $8::text[], $9::text[]
)
ON CONFLICT (dedupe_key) DO NOTHING";

pub const UPSERT_AGGREGATE_SQL: &str = "
INSERT INTO file_aggregates
    (file_name, source, reading_type, count, min_value, max_value, avg_value,
     stddev_value, window_start, window_end, computed_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (file_name, reading_type)
DO UPDATE SET
    source = EXCLUDED.source,
    count = EXCLUDED.count,
    min_value = EXCLUDED.min_value,
    max_value = EXCLUDED.max_value,
    avg_value = EXCLUDED.avg_value,
    stddev_value = EXCLUDED.stddev_value,
    window_start = EXCLUDED.window_start,
    window_end = EXCLUDED.window_end,
    computed_at = EXCLUDED.computed_at";

/// What one successful batch write changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub readings_inserted: u64,
    /// Readings whose `dedupe_key` was already stored.
    pub readings_ignored: u64,
    pub aggregates_upserted: u64,
}

pub trait ReadingStore {
    /// Write one batch atomically. Transient failures leave nothing behind.
    async fn write_batch(&self, batch: &FileBatch) -> Result<WriteSummary, StoreError>;
}

/// Write `batch` through `store`, retrying transient failures per `policy`.
pub async fn persist_file<S: ReadingStore>(
    store: &S,
    batch: &FileBatch,
    policy: &RetryPolicy,
) -> Result<WriteSummary, PersistenceError> {
    let operation_name = format!("persist {}", batch.file_name);
    let summary = retry_with_backoff(policy, &operation_name, move || store.write_batch(batch))
        .await
        .map_err(PersistenceError::from)?;

    info!(
        "Persisted {}: {} readings inserted, {} already present, {} aggregates",
        batch.file_name,
        summary.readings_inserted,
        summary.readings_ignored,
        summary.aggregates_upserted
    );
    Ok(summary)
}

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ReadingStore for PgStore {
    async fn write_batch(&self, batch: &FileBatch) -> Result<WriteSummary, StoreError> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let mut inserted = 0u64;
        for (chunk_idx, chunk) in batch.readings.chunks(INSERT_CHUNK_SIZE).enumerate() {
            let columns = ReadingColumns::from_readings(chunk);
            let count = transaction
                .execute(
                    INSERT_READINGS_SQL,
                    &[
                        &columns.sensor_ids,
                        &columns.timestamps,
                        &columns.sources,
                        &columns.locations,
                        &columns.reading_types,
                        &columns.values,
                        &columns.units,
                        &columns.file_names,
                        &columns.dedupe_keys,
                    ],
                )
                .await?;
            debug!(
                "{}: chunk {} inserted {} of {} readings",
                batch.file_name,
                chunk_idx,
                count,
                chunk.len()
            );
            inserted += count;
        }

        for aggregate in &batch.aggregates {
            transaction
                .execute(
                    UPSERT_AGGREGATE_SQL,
                    &[
                        &aggregate.file_name,
                        &aggregate.source,
                        &aggregate.reading_type,
                        &aggregate.count,
                        &aggregate.min_value,
                        &aggregate.max_value,
                        &aggregate.avg_value,
                        &aggregate.stddev_value,
                        &aggregate.window_start,
                        &aggregate.window_end,
                        &aggregate.computed_at,
                    ],
                )
                .await?;
        }

        transaction.commit().await?;

        Ok(WriteSummary {
            readings_inserted: inserted,
            readings_ignored: (batch.readings.len() as u64).saturating_sub(inserted),
            aggregates_upserted: batch.aggregates.len() as u64,
        })
    }
}

/// Column-major view of a chunk of readings, shaped for UNNEST parameters.
struct ReadingColumns<'a> {
    sensor_ids: Vec<&'a str>,
    timestamps: Vec<DateTime<Utc>>,
    sources: Vec<&'a str>,
    locations: Vec<Option<&'a str>>,
    reading_types: Vec<&'a str>,
    values: Vec<f64>,
    units: Vec<Option<&'a str>>,
    file_names: Vec<&'a str>,
    dedupe_keys: Vec<String>,
}

impl<'a> ReadingColumns<'a> {
    fn from_readings(readings: &'a [NormalizedReading]) -> Self {
        let n = readings.len();
        let mut columns = Self {
            sensor_ids: Vec::with_capacity(n),
            timestamps: Vec::with_capacity(n),
            sources: Vec::with_capacity(n),
            locations: Vec::with_capacity(n),
            reading_types: Vec::with_capacity(n),
            values: Vec::with_capacity(n),
            units: Vec::with_capacity(n),
            file_names: Vec::with_capacity(n),
            dedupe_keys: Vec::with_capacity(n),
        };
        for r in readings {
            columns.sensor_ids.push(&r.sensor_id);
            columns.timestamps.push(r.ts);
            columns.sources.push(&r.source);
            columns.locations.push(r.location.as_deref());
            columns.reading_types.push(&r.reading_type);
            columns.values.push(r.reading_value);
            columns.units.push(r.unit.as_deref());
            columns.file_names.push(&r.file_name);
            columns.dedupe_keys.push(r.dedupe_key());
        }
        columns
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    readings: BTreeMap<String, NormalizedReading>,
    aggregates: BTreeMap<(String, String), FileAggregate>,
}

/// In-process store with the same uniqueness rules as [`PgStore`].
///
/// Used for dry runs and tests. Failures queued with [`MemoryStore::fail_next`]
/// are returned, in order, by the next writes before anything is applied.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    scripted_failures: Mutex<VecDeque<StoreError>>,
    attempts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: StoreError) {
        lock(&self.scripted_failures).push_back(error);
    }

    /// Number of `write_batch` calls so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reading_count(&self) -> usize {
        lock(&self.state).readings.len()
    }

    /// Stored readings ordered by dedupe key.
    pub fn readings(&self) -> Vec<NormalizedReading> {
        lock(&self.state).readings.values().cloned().collect()
    }

    /// Stored aggregates ordered by file name, then reading type.
    pub fn aggregates(&self) -> Vec<FileAggregate> {
        lock(&self.state).aggregates.values().cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReadingStore for MemoryStore {
    async fn write_batch(&self, batch: &FileBatch) -> Result<WriteSummary, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.scripted_failures).pop_front() {
            return Err(error);
        }

        let mut state = lock(&self.state);
        let mut summary = WriteSummary::default();
        for reading in &batch.readings {
            let key = reading.dedupe_key();
            if state.readings.contains_key(&key) {
                summary.readings_ignored += 1;
            } else {
                state.readings.insert(key, reading.clone());
                summary.readings_inserted += 1;
            }
        }
        for aggregate in &batch.aggregates {
            state.aggregates.insert(
                (aggregate.file_name.clone(), aggregate.reading_type.clone()),
                aggregate.clone(),
            );
            summary.aggregates_upserted += 1;
        }
        Ok(summary)
    }
}
