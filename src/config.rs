use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::engine::CalcSettings;
use crate::limits::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{var}: {value} is out of range ({reason})")]
    OutOfRange {
        var: &'static str,
        value: u64,
        reason: &'static str,
    },
}

/// Process configuration, read from `SLOTCALC_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// JSON directory export the in-memory source is loaded from.
    pub source_path: PathBuf,
    pub buffer_minutes: u32,
    pub horizon_days: u32,
    pub insert_batch_size: usize,
    pub timezone: Tz,
    pub metrics_port: Option<u16>,
    /// Period of the all-tenant sweep.
    pub recalc_interval: Duration,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            source_path: PathBuf::from("./directory.json"),
            buffer_minutes: DEFAULT_BUFFER_MINUTES,
            horizon_days: DEFAULT_HORIZON_DAYS,
            insert_batch_size: MAX_INSERT_BATCH,
            timezone: Tz::UTC,
            metrics_port: None,
            recalc_interval: Duration::from_secs(86_400),
            compact_threshold: 1000,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn at_most(var: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            reason: "too large",
        });
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("SLOTCALC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("SLOTCALC_SOURCE_PATH") {
            config.source_path = PathBuf::from(path);
        }
        if let Some(buffer) = parsed::<u32>(&lookup, "SLOTCALC_BUFFER_MINUTES")? {
            at_most("SLOTCALC_BUFFER_MINUTES", buffer.into(), MAX_BUFFER_MINUTES.into())?;
            config.buffer_minutes = buffer;
        }
        if let Some(days) = parsed::<u32>(&lookup, "SLOTCALC_HORIZON_DAYS")? {
            at_most("SLOTCALC_HORIZON_DAYS", days.into(), MAX_HORIZON_DAYS.into())?;
            config.horizon_days = days;
        }
        if let Some(size) = parsed::<usize>(&lookup, "SLOTCALC_INSERT_BATCH_SIZE")? {
            if size == 0 {
                return Err(ConfigError::OutOfRange {
                    var: "SLOTCALC_INSERT_BATCH_SIZE",
                    value: 0,
                    reason: "must be positive",
                });
            }
            config.insert_batch_size = size.min(MAX_INSERT_BATCH);
        }
        if let Some(tz) = parsed::<Tz>(&lookup, "SLOTCALC_TIMEZONE")? {
            config.timezone = tz;
        }
        config.metrics_port = parsed(&lookup, "SLOTCALC_METRICS_PORT")?;
        if let Some(secs) = parsed::<u64>(&lookup, "SLOTCALC_RECALC_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::OutOfRange {
                    var: "SLOTCALC_RECALC_INTERVAL_SECS",
                    value: 0,
                    reason: "must be positive",
                });
            }
            config.recalc_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = parsed(&lookup, "SLOTCALC_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        Ok(config)
    }

    pub fn calc_settings(&self) -> CalcSettings {
        CalcSettings {
            buffer_minutes: self.buffer_minutes,
            horizon_days: self.horizon_days,
            timezone: self.timezone,
            insert_batch_size: self.insert_batch_size,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slots.wal")
    }
}
