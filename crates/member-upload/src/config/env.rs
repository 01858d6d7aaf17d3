//! Environment-driven configuration.
//!
//! Every setting can be overridden with a `MEMBER_UPLOAD_*` variable. Unset
//! variables keep their defaults; malformed ones are an error rather than
//! being silently ignored.

use std::path::PathBuf;
use std::str::FromStr;

use super::schema::UploadConfig;
use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "MEMBER_UPLOAD_";

impl UploadConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut not_unicode = None;
        let config = Self::from_lookup(|key| match std::env::var(key) {
            Ok(value) => Some(value),
            Err(std::env::VarError::NotPresent) => None,
            Err(std::env::VarError::NotUnicode(_)) => {
                not_unicode.get_or_insert_with(|| key.to_string());
                None
            }
        });
        if let Some(key) = not_unicode {
            return Err(ConfigError::NotUnicode(key));
        }
        config
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Keys are the full variable names, e.g. `MEMBER_UPLOAD_WORKERS`.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let mut config = match get("DATA_DIR") {
            Some((_, dir)) => UploadConfig::with_data_dir(PathBuf::from(dir)),
            None => UploadConfig::default(),
        };

        if let Some((_, v)) = get("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) = get("REPORTS_DIR") {
            config.reports_dir = Some(PathBuf::from(v));
        }

        // Queue
        if let Some((k, v)) = get("WORKERS") {
            config.queue.worker_count = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_ATTEMPTS") {
            config.queue.max_attempts = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("STALL_TIMEOUT_SECS") {
            config.queue.stall_timeout_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_BACKOFF_SECS") {
            config.queue.retry_backoff_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("PRECHECK_RATE_LIMIT") {
            config.queue.precheck_rate_limit = parse_bool(&k, &v)?;
        }

        // Intake
        if let Some((k, v)) = get("MAX_FILE_BYTES") {
            config.intake.max_file_bytes = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MIN_AGE") {
            config.intake.min_age = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_AGE") {
            config.intake.max_age = parse(&k, &v)?;
        }

        // Persistence
        if let Some((k, v)) = get("BATCH_SIZE") {
            config.persist.batch_size = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("PERSIST_NOT_FOUND") {
            config.persist.persist_not_found = parse_bool(&k, &v)?;
        }

        // Verification
        if let Some((k, v)) = get("VERIFY_ENABLED") {
            config.verify.enabled = parse_bool(&k, &v)?;
        }
        if let Some((_, v)) = get("VERIFY_URL") {
            config.verify.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some((_, v)) = get("VERIFY_API_KEY_ENV") {
            config.verify.api_key_env = v;
        }
        if let Some((k, v)) = get("VERIFY_TIMEOUT_SECS") {
            config.verify.timeout_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_RATE_LIMIT") {
            config.verify.rate_limit = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_RATE_WINDOW_SECS") {
            config.verify.rate_window_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_MAX_WAIT_SECS") {
            config.verify.max_wait_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_CACHE_TTL_SECS") {
            config.verify.cache_ttl_secs = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_MAX_RETRIES") {
            config.verify.max_retries = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_BACKOFF_MS") {
            config.verify.backoff_base_ms = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("VERIFY_PARALLELISM") {
            config.verify.parallelism = parse(&k, &v)?;
        }

        // Watcher
        if let Some((_, v)) = get("WATCH_DIR") {
            config.watch.directory = Some(PathBuf::from(v));
        }
        if let Some((k, v)) = get("WATCH_POLL_SECS") {
            config.watch.poll_interval_secs = parse(&k, &v)?;
        }
        if let Some((_, v)) = get("WATCH_INCLUDE") {
            config.watch.include = v
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some((_, v)) = get("WATCH_SUBMITTER") {
            config.watch.submitter = Some(v);
        }

        // Retention
        if let Some((k, v)) = get("RETENTION_DAYS") {
            config.retention.retention_days = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("SWEEP_INTERVAL_SECS") {
            config.retention.sweep_interval_secs = parse(&k, &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
