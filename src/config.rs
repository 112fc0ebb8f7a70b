use crate::errors::{Result, SnapshotError};
use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Firestore-style stores reject batches above this many operations.
pub const STORE_BATCH_HARD_CAP: usize = 500;

pub struct Config {
    pub debug_mode: bool,
    pub debug_record_limit: usize,
    pub data_dir: String,
    pub snapshot_collection: String,
    pub history_collection: String,
    pub chunk_size: usize,
    pub commit_pause: Duration,
    pub request_timeout: Duration,
    pub commit_timeout: Duration,
    pub timezone: Tz,
    pub lookback_days: i64,
    pub history_days: i64,
}

impl Config {
    pub fn new() -> Self {
        Self {
            debug_mode: false,
            debug_record_limit: 10,
            data_dir: "data".to_string(),
            snapshot_collection: "fonlar".to_string(),
            history_collection: "market_grafigi".to_string(),
            chunk_size: 400,
            commit_pause: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(30),
            timezone: chrono_tz::Europe::Istanbul,
            lookback_days: 5,  // 跨周末也能拿到前一个交易日
            history_days: 365,
        }
    }

    /// 从 MARKET_SNAPSHOT_* 环境变量覆盖默认值
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(dir) = env_var("DATA_DIR") {
            config.data_dir = dir;
        }
        if let Some(name) = env_var("COLLECTION") {
            config.snapshot_collection = name;
        }
        if let Some(name) = env_var("HISTORY_COLLECTION") {
            config.history_collection = name;
        }
        if let Some(size) = env_var("CHUNK_SIZE") {
            config.chunk_size = parse_env("CHUNK_SIZE", &size)?;
        }
        if let Some(ms) = env_var("COMMIT_PAUSE_MS") {
            config.commit_pause = Duration::from_millis(parse_env("COMMIT_PAUSE_MS", &ms)?);
        }
        if let Some(secs) = env_var("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = env_var("COMMIT_TIMEOUT_SECS") {
            config.commit_timeout = Duration::from_secs(parse_env("COMMIT_TIMEOUT_SECS", &secs)?);
        }
        if let Some(tz) = env_var("TIMEZONE") {
            config.timezone = tz
                .parse::<Tz>()
                .map_err(|e| SnapshotError::ConfigError(format!("MARKET_SNAPSHOT_TIMEZONE: {}", e)))?;
        }
        if let Some(days) = env_var("LOOKBACK_DAYS") {
            config.lookback_days = parse_env("LOOKBACK_DAYS", &days)?;
        }
        if let Some(days) = env_var("HISTORY_DAYS") {
            config.history_days = parse_env("HISTORY_DAYS", &days)?;
        }

        Ok(config)
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn with_debug_record_limit(mut self, limit: usize) -> Self {
        self.debug_record_limit = limit;
        self
    }

    pub fn with_data_dir(mut self, dir: &str) -> Self {
        self.data_dir = dir.to_string();
        self
    }

    pub fn with_snapshot_collection(mut self, name: &str) -> Self {
        self.snapshot_collection = name.to_string();
        self
    }

    pub fn with_history_collection(mut self, name: &str) -> Self {
        self.history_collection = name.to_string();
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_commit_pause(mut self, pause: Duration) -> Self {
        self.commit_pause = pause;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_history_days(mut self, days: i64) -> Self {
        self.history_days = days;
        self
    }

    /// Checks settings that would otherwise fail halfway through a run.
    pub fn validate(&self, store_cap: usize) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SnapshotError::ConfigError("chunk size must be at least 1".to_string()));
        }
        if self.chunk_size > store_cap {
            return Err(SnapshotError::ConfigError(format!(
                "chunk size {} exceeds the store limit of {} operations per batch",
                self.chunk_size, store_cap
            )));
        }
        if self.snapshot_collection.trim().is_empty() || self.history_collection.trim().is_empty() {
            return Err(SnapshotError::ConfigError("collection names must not be empty".to_string()));
        }
        if self.lookback_days < 0 || self.history_days < 0 {
            return Err(SnapshotError::ConfigError("lookback windows must not be negative".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("MARKET_SNAPSHOT_{}", suffix))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(suffix: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        SnapshotError::ConfigError(format!("MARKET_SNAPSHOT_{}={:?}: {}", suffix, raw, e))
    })
}
