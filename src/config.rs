use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings, read from `AGENDA_*` environment variables.
/// Missing or unparsable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Longest wait for a day lock or link lock.
    pub lock_timeout: Duration,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// Day locks older than this many days are pruned.
    pub day_lock_retention_days: u32,
    pub maintenance_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_timeout: Duration::from_millis(3000),
            compact_threshold: 1000,
            day_lock_retention_days: 180,
            maintenance_interval: Duration::from_secs(3600),
            metrics_port: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("AGENDA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_timeout: env_parse("AGENDA_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            compact_threshold: env_parse("AGENDA_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            day_lock_retention_days: env_parse("AGENDA_DAY_LOCK_RETENTION_DAYS")
                .unwrap_or(defaults.day_lock_retention_days),
            maintenance_interval: env_parse("AGENDA_MAINTENANCE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.maintenance_interval),
            metrics_port: env_parse("AGENDA_METRICS_PORT"),
        }
    }

    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
