// src/db.rs
use crate::config::DbSettings;
use crate::errors::PipelineError;
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use log::info;
use tokio_postgres::NoTls;

pub type DbPool = Pool;

/// Tables and indexes the pipeline writes to. Safe to run repeatedly.
pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS raw_readings (
    id            BIGSERIAL PRIMARY KEY,
    sensor_id     TEXT             NOT NULL,
    ts            TIMESTAMPTZ      NOT NULL,
    source        TEXT             NOT NULL,
    location      TEXT,
    reading_type  TEXT             NOT NULL,
    reading_value DOUBLE PRECISION NOT NULL,
    unit          TEXT,
    file_name     TEXT             NOT NULL,
    ingested_at   TIMESTAMPTZ      NOT NULL DEFAULT now(),
    dedupe_key    TEXT             NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS raw_readings_sensor_ts_idx ON raw_readings (sensor_id, ts);

CREATE TABLE IF NOT EXISTS file_aggregates (
    id            BIGSERIAL PRIMARY KEY,
    file_name     TEXT             NOT NULL,
    source        TEXT             NOT NULL,
    reading_type  TEXT             NOT NULL,
    count         BIGINT           NOT NULL,
    min_value     DOUBLE PRECISION NOT NULL,
    max_value     DOUBLE PRECISION NOT NULL,
    avg_value     DOUBLE PRECISION NOT NULL,
    stddev_value  DOUBLE PRECISION,
    window_start  TIMESTAMPTZ      NOT NULL,
    window_end    TIMESTAMPTZ      NOT NULL,
    computed_at   TIMESTAMPTZ      NOT NULL,
    UNIQUE (file_name, reading_type)
);
";

/// Creates a Deadpool PostgreSQL connection pool.
///
/// Uses `settings.url` when set, otherwise the individual host/port/user fields.
/// No connection is opened until the pool is first used.
pub fn create_pool(settings: &DbSettings) -> Result<DbPool, PipelineError> {
    let mut cfg = Config::new();
    match &settings.url {
        Some(url) => cfg.url = Some(url.clone()),
        None => {
            cfg.host = Some(settings.host.clone());
            cfg.port = Some(settings.port);
            cfg.user = Some(settings.user.clone());
            cfg.password = Some(settings.password.clone());
            cfg.dbname = Some(settings.dbname.clone());
        }
    }
    cfg.pool = Some(PoolConfig::new(settings.pool_size));

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| PipelineError::DbPoolError(format!("Failed to create database pool: {}", e)))?;

    info!(
        "Created database connection pool (max_size={})",
        settings.pool_size
    );
    Ok(pool)
}

/// Create the reading and aggregate tables if they are missing.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), PipelineError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA_SQL).await?;
    info!("Database schema is in place");
    Ok(())
}
