//! Runtime configuration, env-driven with defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Days the log is retained before archival + cleanup.
    pub retention_days: u32,
    /// Recurring cleanup schedule (five-field cron, local to UTC).
    pub cleanup_cron: String,
    /// Attempts per queue job before dead-lettering.
    pub max_retries: u32,
    /// Initial retry backoff.
    pub backoff_delay_ms: u64,
    /// Read batch size for integrity verification.
    pub batch_size: u32,
    /// Rule hot-reload interval; 0 disables the loop.
    pub hot_reload_interval_ms: u64,
    /// Context window handed to the rule engine.
    pub recent_window_minutes: i64,
    pub recent_window_cap: u32,
    /// Per-rule evaluation deadline.
    pub rule_timeout_ms: u64,
    /// Where compressed archives land.
    pub archive_dir: PathBuf,
    /// Concurrency for the maintenance lanes (the log lane is serial).
    pub worker_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention_days: 90,
            cleanup_cron: "0 2 * * *".to_string(),
            max_retries: 3,
            backoff_delay_ms: 2_000,
            batch_size: 100,
            hot_reload_interval_ms: 60_000,
            recent_window_minutes: 60,
            recent_window_cap: 500,
            rule_timeout_ms: 500,
            archive_dir: PathBuf::from("archives"),
            worker_concurrency: 4,
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `RETENTION_DAYS`, `CLEANUP_CRON`,
    /// `MAX_RETRIES`, `BACKOFF_DELAY_MS`, `BATCH_SIZE`,
    /// `HOT_RELOAD_INTERVAL_MS`, `RULE_TIMEOUT_MS`, `ARCHIVE_DIR`,
    /// `WORKER_CONCURRENCY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn var<T: std::str::FromStr>(name: &str, fallback: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        }

        Self {
            retention_days: var("RETENTION_DAYS", defaults.retention_days),
            cleanup_cron: std::env::var("CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            max_retries: var("MAX_RETRIES", defaults.max_retries),
            backoff_delay_ms: var("BACKOFF_DELAY_MS", defaults.backoff_delay_ms),
            batch_size: var("BATCH_SIZE", defaults.batch_size),
            hot_reload_interval_ms: var("HOT_RELOAD_INTERVAL_MS", defaults.hot_reload_interval_ms),
            recent_window_minutes: var("RECENT_WINDOW_MINUTES", defaults.recent_window_minutes),
            recent_window_cap: var("RECENT_WINDOW_CAP", defaults.recent_window_cap),
            rule_timeout_ms: var("RULE_TIMEOUT_MS", defaults.rule_timeout_ms),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            worker_concurrency: var("WORKER_CONCURRENCY", defaults.worker_concurrency),
        }
    }

    pub fn rule_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_timeout_ms)
    }

    pub fn hot_reload_interval(&self) -> Option<Duration> {
        (self.hot_reload_interval_ms > 0)
            .then(|| Duration::from_millis(self.hot_reload_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.cleanup_cron, "0 2 * * *");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_delay_ms, 2_000);
        assert_eq!(config.recent_window_cap, 500);
        assert_eq!(config.rule_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn zero_interval_disables_hot_reload() {
        let config = Config {
            hot_reload_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.hot_reload_interval().is_none());
    }
}
