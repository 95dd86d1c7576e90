//! Worker and store settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poller::PollerSettings;
use crate::repository::util::is_postgres_url;

/// Default SQLite database filename under the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "ctxflow.db";

fn default_poll_interval() -> f64 {
    5.0
}

fn default_max_attempts() -> i32 {
    3
}

fn default_retry_delay() -> f64 {
    60.0
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_wait_time() -> f64 {
    2.0
}

fn default_lock_expiry() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_retry_delay() -> f64 {
    3600.0
}

fn default_stall_check_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

/// `hostname-pid`, unique per process on a host.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Seconds to sleep when no work was found.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_max_attempts")]
    pub max_processing_attempts: i32,
    /// Base retry delay in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds to wait for a batch to fill.
    #[serde(default = "default_batch_wait_time")]
    pub batch_wait_time: f64,
    #[serde(default)]
    pub batch_processing_enabled: bool,
    #[serde(default = "default_lock_expiry")]
    pub lock_expiry_seconds: u64,
    /// Maximum polled units processed at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Upper bound on the exponential retry backoff, in seconds.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: f64,
    /// Seconds between stalled-item recovery sweeps. 0 disables them.
    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval: u64,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: default_poll_interval(),
            max_processing_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            batch_size: default_batch_size(),
            batch_wait_time: default_batch_wait_time(),
            batch_processing_enabled: false,
            lock_expiry_seconds: default_lock_expiry(),
            max_concurrent: default_max_concurrent(),
            max_retry_delay: default_max_retry_delay(),
            stall_check_interval: default_stall_check_interval(),
            service_type: None,
            organization_id: None,
        }
    }
}

/// Fractional seconds as a duration; unrepresentable values use `fallback`.
fn seconds(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval, default_poll_interval())
    }

    pub fn batch_wait_time(&self) -> Duration {
        seconds(self.batch_wait_time, default_batch_wait_time())
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay, default_retry_delay())
    }

    pub fn max_retry_delay(&self) -> Duration {
        seconds(self.max_retry_delay, default_max_retry_delay())
    }

    /// Settings given in fractional seconds, by name.
    pub fn durations(&self) -> [(&'static str, f64); 4] {
        [
            ("poll_interval", self.poll_interval),
            ("batch_wait_time", self.batch_wait_time),
            ("retry_delay", self.retry_delay),
            ("max_retry_delay", self.max_retry_delay),
        ]
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_secs(self.lock_expiry_seconds)
    }

    pub fn stall_check_interval(&self) -> Option<Duration> {
        (self.stall_check_interval > 0).then(|| Duration::from_secs(self.stall_check_interval))
    }

    /// Backoff before retry number `attempts`: `retry_delay * 2^(attempts-1)`,
    /// capped at `max_retry_delay`.
    pub fn retry_backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        let delay = self.retry_delay().saturating_mul(1u32 << exponent);
        delay.min(self.max_retry_delay())
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            max_processing_attempts: self.max_processing_attempts,
            retry_delay: self.retry_delay(),
            poll_interval: self.poll_interval().min(self.batch_wait_time()),
            service_type: self.service_type.clone(),
            organization_id: self.organization_id.clone(),
        }
    }

    /// Apply `CTXFLOW_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(id) = env_string("CTXFLOW_WORKER_ID") {
            self.worker_id = id;
        }
        if let Some(v) = env_parse("CTXFLOW_POLL_INTERVAL") {
            self.poll_interval = v;
        }
        if let Some(v) = env_parse("CTXFLOW_MAX_ATTEMPTS") {
            self.max_processing_attempts = v;
        }
        if let Some(v) = env_parse("CTXFLOW_RETRY_DELAY") {
            self.retry_delay = v;
        }
        if let Some(v) = env_parse("CTXFLOW_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("CTXFLOW_BATCH_WAIT_TIME") {
            self.batch_wait_time = v;
        }
        if let Some(v) = env_parse("CTXFLOW_BATCH_PROCESSING") {
            self.batch_processing_enabled = v;
        }
        if let Some(v) = env_parse("CTXFLOW_LOCK_EXPIRY") {
            self.lock_expiry_seconds = v;
        }
        if let Some(v) = env_parse("CTXFLOW_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_parse("CTXFLOW_MAX_RETRY_DELAY") {
            self.max_retry_delay = v;
        }
        self
    }
}

/// Which store adapter the worker uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Database,
    Remote,
}

/// Store adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database URL (sqlite path/URL or postgres URL).
    #[serde(default)]
    pub database_url: Option<String>,
    /// Claim lock backend: unset or "memory", "database", or a redis:// URL.
    #[serde(default)]
    pub lock_backend: Option<String>,
    /// Base URL of the remote task service.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub processor_type: Option<String>,
    /// Remote request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            lock_backend: None,
            remote_url: None,
            processor_type: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    /// Default data directory: ~/Documents/ctxflow, falling back to the home
    /// directory, then the current directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ctxflow")
    }

    /// The configured database URL, or a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => shellexpand::tilde(url).into_owned(),
            None => format!(
                "sqlite:{}",
                Self::default_data_dir()
                    .join(DEFAULT_DATABASE_FILENAME)
                    .display()
            ),
        }
    }

    /// Create the parent directory of a SQLite database file.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        if self.backend != StoreBackend::Database {
            return Ok(());
        }
        let url = self.database_url();
        if is_postgres_url(&url) {
            return Ok(());
        }
        let path = url.strip_prefix("sqlite:").unwrap_or(&url);
        let path = Path::new(path.strip_prefix("//").unwrap_or(path));
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = env_string("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = env_string("CTXFLOW_REMOTE_URL") {
            self.remote_url = Some(url);
            self.backend = StoreBackend::Remote;
        }
        if let Some(lock) = env_string("CTXFLOW_LOCK_BACKEND") {
            self.lock_backend = Some(lock);
        }
        if let Some(kind) = env_string("CTXFLOW_PROCESSOR_TYPE") {
            self.processor_type = Some(kind);
        }
        self
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let settings = WorkerSettings {
            retry_delay: 10.0,
            max_retry_delay: 60.0,
            ..Default::default()
        };
        assert_eq!(settings.retry_backoff(1), Duration::from_secs(10));
        assert_eq!(settings.retry_backoff(2), Duration::from_secs(20));
        assert_eq!(settings.retry_backoff(3), Duration::from_secs(40));
        assert_eq!(settings.retry_backoff(4), Duration::from_secs(60));
        assert_eq!(settings.retry_backoff(0), Duration::from_secs(10));
    }

    #[test]
    fn test_database_url_default_is_sqlite() {
        let url = StoreConfig::default().database_url();
        assert!(url.starts_with("sqlite:"));
        assert!(url.ends_with(DEFAULT_DATABASE_FILENAME));
    }

    #[test]
    fn test_worker_defaults_from_empty_section() {
        let settings: WorkerSettings = toml::from_str("").unwrap();
        assert_eq!(settings.max_processing_attempts, 3);
        assert_eq!(settings.max_concurrent, 1);
        assert!(!settings.batch_processing_enabled);
        assert!(!settings.worker_id.is_empty());
        assert_eq!(settings.stall_check_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_retry_backoff_keeps_fractions() {
        let settings = WorkerSettings {
            retry_delay: 0.25,
            max_retry_delay: 0.9,
            ..Default::default()
        };
        assert_eq!(settings.retry_backoff(1), Duration::from_millis(250));
        assert_eq!(settings.retry_backoff(2), Duration::from_millis(500));
        assert_eq!(settings.retry_backoff(3), Duration::from_millis(900));
    }

    #[test]
    fn test_unrepresentable_seconds_fall_back() {
        let settings = WorkerSettings {
            poll_interval: f64::INFINITY,
            batch_wait_time: f64::NAN,
            retry_delay: -3.0,
            max_retry_delay: 1e300,
            ..Default::default()
        };
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.batch_wait_time(), Duration::ZERO);
        assert_eq!(settings.retry_delay(), Duration::ZERO);
        assert_eq!(settings.max_retry_delay(), Duration::from_secs(3600));
    }
}
