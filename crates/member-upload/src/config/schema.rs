use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the upload pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Base directory for the database and report artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/member-upload.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Overrides `<data_dir>/reports`.
    #[serde(default)]
    pub reports_dir: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("member-upload"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            reports_dir: None,
            queue: QueueConfig::default(),
            intake: IntakeConfig::default(),
            persist: PersistConfig::default(),
            verify: VerifyConfig::default(),
            watch: WatchConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl UploadConfig {
    /// Config rooted at `data_dir`, everything else at defaults.
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("member-upload.db"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.reports_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("reports"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.worker_count == 0 {
            return Err(invalid("queue.worker_count must be > 0"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be > 0"));
        }
        if self.persist.batch_size == 0 {
            return Err(invalid("persist.batch_size must be > 0"));
        }
        if self.verify.rate_limit == 0 {
            return Err(invalid("verify.rate_limit must be > 0"));
        }
        if self.verify.rate_window_secs == 0 {
            return Err(invalid("verify.rate_window_secs must be > 0"));
        }
        if self.intake.min_age > self.intake.max_age {
            return Err(invalid("intake.min_age must not exceed intake.max_age"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent workers. Bulk jobs are rate-limit heavy, keep this small.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Attempts before a stalled or failed job is given up on.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// First automatic retry delay; doubles per attempt.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
    /// Reject submissions while the verification budget is exhausted.
    #[serde(default = "default_true")]
    pub precheck_rate_limit: bool,
}

fn default_worker_count() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_supervisor_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            stall_timeout_secs: default_stall_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            precheck_rate_limit: true,
        }
    }
}

impl QueueConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    /// Delay before automatic attempt `attempts + 1`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(1u64 << exp))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_min_age")]
    pub min_age: u32,
    #[serde(default = "default_max_age")]
    pub max_age: u32,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_min_age() -> u32 {
    16
}

fn default_max_age() -> u32 {
    120
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            min_age: default_min_age(),
            max_age: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Rows per upsert transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Persist rows the registry does not know, flagged as unverified.
    #[serde(default = "default_true")]
    pub persist_not_found: bool,
}

fn default_batch_size() -> usize {
    100
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            persist_not_found: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Calls allowed per window, shared by all workers.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Longest wait for window replenishment in blocking mode.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Retries after a transient registry failure before the row is
    /// classified as an error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Concurrent lookups inside one batch.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_base_url() -> String {
    "http://localhost:8089".to_string()
}

fn default_api_key_env() -> String {
    "MEMBER_UPLOAD_VERIFY_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_parallelism() -> usize {
    4
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
            max_wait_secs: default_max_wait_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            parallelism: default_parallelism(),
        }
    }
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Drop folder. Watching is off when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    /// Submitter recorded on watcher jobs. Derived from the folder name when unset.
    #[serde(default)]
    pub submitter: Option<String>,
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_include() -> Vec<String> {
    vec!["*.csv".to_string(), "*.xlsx".to_string()]
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directory: None,
            poll_interval_secs: default_poll_interval_secs(),
            include: default_include(),
            submitter: None,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = UploadConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.worker_count, 2);
        assert_eq!(config.persist.batch_size, 100);
        assert!(config.verify.enabled);
    }

    #[test]
    fn test_derived_paths() {
        let config = UploadConfig::with_data_dir("/var/lib/member-upload");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/member-upload/member-upload.db")
        );
        assert_eq!(
            config.reports_dir(),
            PathBuf::from("/var/lib/member-upload/reports")
        );
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = UploadConfig::default();
        config.queue.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_age_range() {
        let mut config = UploadConfig::default();
        config.intake.min_age = 50;
        config.intake.max_age = 18;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let queue = QueueConfig {
            retry_backoff_secs: 10,
            ..QueueConfig::default()
        };
        assert_eq!(queue.retry_delay(1), Duration::from_secs(10));
        assert_eq!(queue.retry_delay(2), Duration::from_secs(20));
        assert_eq!(queue.retry_delay(3), Duration::from_secs(40));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{"data_dir": "/tmp/mu", "queue": {"worker_count": 4}}"#;
        let config: UploadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.worker_count, 4);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.verify.rate_limit, 60);
    }
}
