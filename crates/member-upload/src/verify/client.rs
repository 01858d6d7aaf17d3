use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::config::VerifyConfig;
use crate::sanitize;

use super::rate_limit::{AcquireMode, RateLimitStatus, RateLimiter};
use super::registry::{LookupError, RegistryLookup, RegistryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Matched,
    NotFound,
    RateLimited,
    Error,
    /// Verification is switched off by configuration.
    Skipped,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Matched => "matched",
            VerificationStatus::NotFound => "not_found",
            VerificationStatus::RateLimited => "rate_limited",
            VerificationStatus::Error => "error",
            VerificationStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub status: VerificationStatus,
    pub details: Option<String>,
    pub record: Option<RegistryRecord>,
}

impl Verification {
    pub(crate) fn new(status: VerificationStatus, details: Option<String>) -> Self {
        Self {
            status,
            details,
            record: None,
        }
    }
}

/// Cached, rate-limited, retrying front for a [`RegistryLookup`].
///
/// Only definitive answers (`matched`, `not_found`) are cached; a cache hit
/// costs no rate-limit budget.
pub struct VerificationClient {
    registry: Arc<dyn RegistryLookup>,
    limiter: Arc<RateLimiter>,
    cache: Cache<String, Verification>,
    enabled: bool,
    max_retries: u32,
    backoff_base: Duration,
    max_wait: Duration,
}

impl VerificationClient {
    pub fn new(
        config: &VerifyConfig,
        registry: Arc<dyn RegistryLookup>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Self {
            registry,
            limiter,
            cache,
            enabled: config.enabled,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            max_wait: config.max_wait(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Bounded-wait mode used by the deferred retry pass.
    pub fn wait_mode(&self) -> AcquireMode {
        AcquireMode::Wait(self.max_wait)
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    pub fn verify(&self, id_number: &str, mode: AcquireMode) -> Verification {
        if !self.enabled {
            return Verification::new(VerificationStatus::Skipped, None);
        }

        if let Some(hit) = self.cache.get(id_number) {
            debug!("Verification cache hit for {}", sanitize::mask_identifier(id_number));
            return hit;
        }

        let mut attempt = 0u32;
        loop {
            if let Err(resets_in) = self.limiter.acquire(mode) {
                return Verification::new(
                    VerificationStatus::RateLimited,
                    Some(format!("rate limit budget resets in {}s", resets_in.as_secs().max(1))),
                );
            }

            match self.registry.lookup(id_number) {
                Ok(record) => {
                    let status = if record.registered {
                        VerificationStatus::Matched
                    } else {
                        VerificationStatus::NotFound
                    };
                    let verification = Verification {
                        status,
                        details: None,
                        record: Some(record),
                    };
                    self.cache.insert(id_number.to_string(), verification.clone());
                    return verification;
                }
                Err(LookupError::NotFound) => {
                    let verification = Verification::new(VerificationStatus::NotFound, None);
                    self.cache.insert(id_number.to_string(), verification.clone());
                    return verification;
                }
                Err(LookupError::RateLimited) => {
                    return Verification::new(
                        VerificationStatus::RateLimited,
                        Some("registry returned 429".to_string()),
                    );
                }
                Err(LookupError::Transient(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        "Transient registry failure for {} (attempt {}), retrying in {:?}: {}",
                        sanitize::mask_identifier(id_number),
                        attempt,
                        delay,
                        msg
                    );
                    thread::sleep(delay);
                }
                Err(LookupError::Transient(msg)) => {
                    return Verification::new(
                        VerificationStatus::Error,
                        Some(format!("gave up after {} attempts: {}", attempt + 1, msg)),
                    );
                }
                Err(LookupError::Service(msg)) => {
                    return Verification::new(VerificationStatus::Error, Some(msg));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of answers and counts calls.
    struct Scripted {
        answers: Mutex<VecDeque<Result<RegistryRecord, LookupError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<RegistryRecord, LookupError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl RegistryLookup for Scripted {
        fn lookup(&self, _id_number: &str) -> Result<RegistryRecord, LookupError> {
            *self.calls.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LookupError::Service("script exhausted".to_string())))
        }
    }

    fn config() -> VerifyConfig {
        VerifyConfig {
            backoff_base_ms: 1,
            max_retries: 2,
            ..VerifyConfig::default()
        }
    }

    fn registered() -> Result<RegistryRecord, LookupError> {
        Ok(RegistryRecord {
            registered: true,
            ..RegistryRecord::default()
        })
    }

    fn client(script: Arc<Scripted>, limit: u32) -> VerificationClient {
        let limiter = Arc::new(RateLimiter::new(limit, Duration::from_secs(60)));
        VerificationClient::new(&config(), script, limiter)
    }

    #[test]
    fn test_cache_hit_skips_budget() {
        let script = Scripted::new(vec![registered()]);
        let client = client(script.clone(), 10);

        assert_eq!(
            client.verify("8001015009087", AcquireMode::FailFast).status,
            VerificationStatus::Matched
        );
        assert_eq!(
            client.verify("8001015009087", AcquireMode::FailFast).status,
            VerificationStatus::Matched
        );
        assert_eq!(script.calls(), 1);
        assert_eq!(client.rate_limit_status().remaining, 9);
    }

    #[test]
    fn test_unregistered_is_not_found() {
        let script = Scripted::new(vec![Ok(RegistryRecord::default()), Err(LookupError::NotFound)]);
        let client = client(script, 10);
        assert_eq!(
            client.verify("1", AcquireMode::FailFast).status,
            VerificationStatus::NotFound
        );
        assert_eq!(
            client.verify("2", AcquireMode::FailFast).status,
            VerificationStatus::NotFound
        );
    }

    #[test]
    fn test_fail_fast_when_budget_exhausted() {
        let script = Scripted::new(vec![registered()]);
        let client = client(script.clone(), 1);

        client.verify("1", AcquireMode::FailFast);
        let second = client.verify("2", AcquireMode::FailFast);
        assert_eq!(second.status, VerificationStatus::RateLimited);
        assert_eq!(script.calls(), 1);
    }

    #[test]
    fn test_transient_errors_are_retried_then_reported() {
        let script = Scripted::new(vec![
            Err(LookupError::Transient("timeout".to_string())),
            registered(),
        ]);
        let recovered = client(script.clone(), 10).verify("1", AcquireMode::FailFast);
        assert_eq!(recovered.status, VerificationStatus::Matched);
        assert_eq!(script.calls(), 2);

        let script = Scripted::new(vec![
            Err(LookupError::Transient("timeout".to_string())),
            Err(LookupError::Transient("timeout".to_string())),
            Err(LookupError::Transient("timeout".to_string())),
        ]);
        let failed = client(script.clone(), 10).verify("1", AcquireMode::FailFast);
        assert_eq!(failed.status, VerificationStatus::Error);
        assert_eq!(script.calls(), 3);
    }

    #[test]
    fn test_rate_limited_answers_are_not_cached() {
        let script = Scripted::new(vec![Err(LookupError::RateLimited), registered()]);
        let client = client(script.clone(), 10);
        assert_eq!(
            client.verify("1", AcquireMode::FailFast).status,
            VerificationStatus::RateLimited
        );
        assert_eq!(
            client.verify("1", AcquireMode::FailFast).status,
            VerificationStatus::Matched
        );
    }

    #[test]
    fn test_disabled_client_skips() {
        let script = Scripted::new(vec![]);
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let config = VerifyConfig {
            enabled: false,
            ..VerifyConfig::default()
        };
        let client = VerificationClient::new(&config, script.clone(), limiter);
        assert_eq!(
            client.verify("1", AcquireMode::FailFast).status,
            VerificationStatus::Skipped
        );
        assert_eq!(script.calls(), 0);
    }
}
