use std::path::PathBuf;
use std::time::Duration;

/// Host settings, read from `TORQUE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Prometheus listener port; `None` disables the exporter.
    pub metrics_port: Option<u16>,
    /// Journal appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("TORQUE_DATA_DIR")
                .filter(|s| !s.is_empty())
                .map_or(defaults.data_dir, PathBuf::from),
            metrics_port: parse_var(&lookup, "TORQUE_METRICS_PORT"),
            compact_threshold: parse_var(&lookup, "TORQUE_COMPACT_THRESHOLD")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(defaults.compact_threshold),
            compact_interval: parse_var(&lookup, "TORQUE_COMPACT_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map_or(defaults.compact_interval, Duration::from_secs),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("torque.journal")
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
