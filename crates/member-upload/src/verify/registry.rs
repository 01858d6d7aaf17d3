//! Transport to the external voter registry.

use std::time::Duration;

use log::warn;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VerifyConfig;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Failed to build registry HTTP client: {0}")]
    ClientBuild(String),

    #[error("Environment variable {name} is not valid unicode")]
    ApiKeyNotUnicode { name: String },
}

/// Registry answer for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub ward_code: Option<String>,
    #[serde(default)]
    pub voting_district: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("identifier not found in registry")]
    NotFound,

    #[error("registry rate limit exceeded")]
    RateLimited,

    /// Timeouts, connection failures and 5xx. Worth retrying.
    #[error("transient registry failure: {0}")]
    Transient(String),

    #[error("registry error: {0}")]
    Service(String),
}

pub trait RegistryLookup: Send + Sync {
    fn lookup(&self, id_number: &str) -> Result<RegistryRecord, LookupError>;
}

/// `GET {base_url}/voters/{id}` over blocking reqwest.
pub struct HttpRegistry {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpRegistry {
    /// Builds the client and resolves the API key from the variable named by
    /// `config.api_key_env`. A missing key is allowed; requests then go out
    /// unauthenticated.
    pub fn new(config: &VerifyConfig) -> Result<Self, VerifyError> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Some(SecretString::from(value.trim())),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                warn!(
                    "{} is not set, registry requests will be unauthenticated",
                    config.api_key_env
                );
                None
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                return Err(VerifyError::ApiKeyNotUnicode {
                    name: config.api_key_env.clone(),
                })
            }
        };

        Self::with_api_key(&config.base_url, config.timeout(), api_key)
    }

    pub fn with_api_key(
        base_url: &str,
        timeout: Duration,
        api_key: Option<SecretString>,
    ) -> Result<Self, VerifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("member-upload/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VerifyError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl RegistryLookup for HttpRegistry {
    fn lookup(&self, id_number: &str) -> Result<RegistryRecord, LookupError> {
        let url = format!("{}/voters/{}", self.base_url, id_number);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        // Error strings must not carry the URL, it contains the identifier.
        let response = request
            .send()
            .map_err(|e| LookupError::Transient(e.without_url().to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => response.json::<RegistryRecord>().map_err(|e| {
                LookupError::Service(format!("invalid response body: {}", e.without_url()))
            }),
            404 => Err(LookupError::NotFound),
            429 => Err(LookupError::RateLimited),
            code if status.is_server_error() => Err(LookupError::Transient(format!("HTTP {}", code))),
            code => Err(LookupError::Service(format!("HTTP {}", code))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    const ID: &str = "8001015009087";

    fn registry(server: &MockServer, key: Option<&str>) -> HttpRegistry {
        HttpRegistry::with_api_key(
            &server.base_url(),
            Duration::from_secs(2),
            key.map(SecretString::from),
        )
        .unwrap()
    }

    #[test]
    fn test_registered_voter() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path(format!("/voters/{}", ID))
                .header("Authorization", "Bearer test-key");
            then.status(200).json_body(json!({
                "registered": true,
                "ward_code": "79700001",
                "voting_district": "97090001"
            }));
        });

        let record = registry(&server, Some("test-key")).lookup(ID).unwrap();
        mock.assert();
        assert!(record.registered);
        assert_eq!(record.ward_code.as_deref(), Some("79700001"));
    }

    #[test]
    fn test_status_mapping() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/voters/404");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/voters/429");
            then.status(429);
        });
        server.mock(|when, then| {
            when.method(GET).path("/voters/503");
            then.status(503);
        });
        server.mock(|when, then| {
            when.method(GET).path("/voters/400");
            then.status(400);
        });

        let registry = registry(&server, None);
        assert_eq!(registry.lookup("404"), Err(LookupError::NotFound));
        assert_eq!(registry.lookup("429"), Err(LookupError::RateLimited));
        assert!(matches!(registry.lookup("503"), Err(LookupError::Transient(_))));
        assert!(matches!(registry.lookup("400"), Err(LookupError::Service(_))));
    }

    #[test]
    fn test_connection_failure_is_transient() {
        let registry =
            HttpRegistry::with_api_key("http://127.0.0.1:1", Duration::from_millis(200), None)
                .unwrap();
        match registry.lookup(ID) {
            Err(LookupError::Transient(msg)) => assert!(!msg.contains(ID)),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
