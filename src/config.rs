use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use log::debug;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Intake, processed and quarantine areas under one data directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLayout {
    pub incoming: PathBuf,
    pub processed: PathBuf,
    pub quarantine: PathBuf,
}

impl DataLayout {
    pub fn from_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            incoming: data_dir.join("incoming"),
            processed: data_dir.join("processed"),
            quarantine: data_dir.join("quarantine"),
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.incoming, &self.processed, &self.quarantine] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbSettings {
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_size: usize,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "sensor".to_string(),
            password: "sensorpw".to_string(),
            dbname: "sensordb".to_string(),
            pool_size: 10,
        }
    }
}

/// Plausible range for canonical channels, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ranges {
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub rh_min: f64,
    pub rh_max: f64,
}

impl Default for Ranges {
    fn default() -> Self {
        Self {
            temp_min_c: -50.0,
            temp_max_c: 50.0,
            rh_min: 0.0,
            rh_max: 100.0,
        }
    }
}

/// Maps raw channel codes onto a canonical reading type and unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRule {
    /// Lowercase codes accepted for this channel.
    pub codes: &'static [&'static str],
    pub reading_type: &'static str,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
}

impl ChannelRule {
    pub fn matches(&self, code: &str) -> bool {
        let code = code.trim().to_lowercase();
        self.codes.iter().any(|c| *c == code)
    }

    pub fn in_range(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub layout: DataLayout,
    pub source_name: String,
    pub default_sensor_id: String,
    pub default_location: String,
    pub ranges: Ranges,
    /// Numeric placeholder meaning "no reading".
    pub sentinel: Option<f64>,
    pub delimiter: u8,
    pub poll_interval: Duration,
    pub keep_incoming: bool,
    pub retry: RetryPolicy,
    pub db: DbSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            layout: DataLayout::from_data_dir("data"),
            source_name: "kaggle/airquality".to_string(),
            default_sensor_id: "Station_1".to_string(),
            default_location: "Milan_AirQuality".to_string(),
            ranges: Ranges::default(),
            sentinel: Some(-200.0),
            delimiter: b';',
            poll_interval: Duration::from_secs(5),
            keep_incoming: false,
            retry: RetryPolicy::default(),
            db: DbSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from defaults overlaid with whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("DATA_DIR") {
            cfg.layout = DataLayout::from_data_dir(dir);
        }
        if let Some(v) = lookup("SOURCE_NAME") {
            cfg.source_name = v;
        }
        if let Some(v) = lookup("DEFAULT_SENSOR_ID") {
            cfg.default_sensor_id = v;
        }
        if let Some(v) = lookup("DEFAULT_LOCATION") {
            cfg.default_location = v;
        }

        set_parsed(&lookup, "TEMP_MIN_C", &mut cfg.ranges.temp_min_c)?;
        set_parsed(&lookup, "TEMP_MAX_C", &mut cfg.ranges.temp_max_c)?;
        set_parsed(&lookup, "RH_MIN", &mut cfg.ranges.rh_min)?;
        set_parsed(&lookup, "RH_MAX", &mut cfg.ranges.rh_max)?;

        if let Some(v) = lookup("SENTINEL_VALUE") {
            cfg.sentinel = match v.trim().to_lowercase().as_str() {
                "" | "none" => None,
                other => Some(parse_value("SENTINEL_VALUE", other)?),
            };
        }

        let mut poll_secs = cfg.poll_interval.as_secs();
        set_parsed(&lookup, "POLL_INTERVAL_SECONDS", &mut poll_secs)?;
        cfg.poll_interval = Duration::from_secs(poll_secs);

        if let Some(v) = lookup("KEEP_INCOMING") {
            cfg.keep_incoming = parse_flag(&v);
        }

        set_parsed(&lookup, "DB_RETRY_MAX_ATTEMPTS", &mut cfg.retry.max_attempts)?;
        let mut initial_ms = cfg.retry.initial_delay.as_millis() as u64;
        set_parsed(&lookup, "DB_RETRY_INITIAL_DELAY_MS", &mut initial_ms)?;
        cfg.retry.initial_delay = Duration::from_millis(initial_ms);
        let mut max_ms = cfg.retry.max_delay.as_millis() as u64;
        set_parsed(&lookup, "DB_RETRY_MAX_DELAY_MS", &mut max_ms)?;
        cfg.retry.max_delay = Duration::from_millis(max_ms);

        cfg.db.url = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty());
        if let Some(v) = lookup("PGHOST") {
            cfg.db.host = v;
        }
        set_parsed(&lookup, "PGPORT", &mut cfg.db.port)?;
        if let Some(v) = lookup("PGUSER") {
            cfg.db.user = v;
        }
        if let Some(v) = lookup("PGPASSWORD") {
            cfg.db.password = v;
        }
        if let Some(v) = lookup("PGDATABASE") {
            cfg.db.dbname = v;
        }
        set_parsed(&lookup, "DB_POOL_SIZE", &mut cfg.db.pool_size)?;

        Ok(cfg)
    }

    /// Overlays the keys present in a JSON config file.
    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.data_dir {
            self.layout = DataLayout::from_data_dir(dir);
        }
        if let Some(v) = file.source_name {
            self.source_name = v;
        }
        if let Some(v) = file.default_sensor_id {
            self.default_sensor_id = v;
        }
        if let Some(v) = file.default_location {
            self.default_location = v;
        }
        if let Some(v) = file.ranges {
            self.ranges = v;
        }
        if let Some(v) = file.sentinel {
            self.sentinel = v;
        }
        if let Some(v) = file.poll_interval_seconds {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.keep_incoming {
            self.keep_incoming = v;
        }
        if let Some(v) = file.retry {
            self.retry = v;
        }
        if let Some(v) = file.database_url {
            self.db.url = Some(v);
        }
        if let Some(v) = file.db_pool_size {
            self.db.pool_size = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.ranges;
        if r.temp_min_c > r.temp_max_c {
            return Err(ConfigError::Inconsistent(format!(
                "temperature range is inverted ({} > {})",
                r.temp_min_c, r.temp_max_c
            )));
        }
        if r.rh_min > r.rh_max {
            return Err(ConfigError::Inconsistent(format!(
                "humidity range is inverted ({} > {})",
                r.rh_min, r.rh_max
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.db.pool_size == 0 {
            return Err(ConfigError::Inconsistent(
                "db pool size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonicalization table for this configuration.
    pub fn channel_rules(&self) -> Vec<ChannelRule> {
        vec![
            ChannelRule {
                codes: &["t", "temp", "temperature"],
                reading_type: "temperature (C)",
                unit: "C",
                min: self.ranges.temp_min_c,
                max: self.ranges.temp_max_c,
            },
            ChannelRule {
                codes: &["rh", "humidity"],
                reading_type: "humidity (%)",
                unit: "%",
                min: self.ranges.rh_min,
                max: self.ranges.rh_max,
            },
        ]
    }
}

/// Optional keys accepted in a JSON config file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub default_sensor_id: Option<String>,
    #[serde(default)]
    pub default_location: Option<String>,
    #[serde(default)]
    pub ranges: Option<Ranges>,
    /// `null` disables sentinel handling; absent keeps the current value.
    #[serde(default, deserialize_with = "explicit_null")]
    pub sentinel: Option<Option<f64>>,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default)]
    pub keep_incoming: Option<bool>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub db_pool_size: Option<usize>,
}

// Function to load the configuration from the JSON file
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let file = File::open(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!("Reading pipeline configuration from {}", path.display());
    let reader = BufReader::new(file);

    serde_json::from_reader(reader).map_err(|e| ConfigError::JsonParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(Some)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = parse_value(key, &raw)?;
    }
    Ok(())
}
