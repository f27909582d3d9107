//! Client configuration.
//!
//! Defaults target a local backend. Every field can be overridden from the
//! environment or in code:
//!
//! | Variable | Field |
//! |---|---|
//! | `THERAPIST_API_URL` | `base_url` |
//! | `THERAPIST_API_TIMEOUT_SECS` | `timeout` |
//! | `THERAPIST_API_USER_AGENT` | `user_agent` |

use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_USER_AGENT: &str = concat!("therapist-session/", env!("CARGO_PKG_VERSION"));

const ENV_BASE_URL: &str = "THERAPIST_API_URL";
const ENV_TIMEOUT_SECS: &str = "THERAPIST_API_TIMEOUT_SECS";
const ENV_USER_AGENT: &str = "THERAPIST_API_USER_AGENT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Backend origin, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Per-request timeout, refresh and identity calls included.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables. Unset or malformed values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            config.base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_TIMEOUT_SECS),
            }
        }
        if let Some(ua) = lookup(ENV_USER_AGENT).filter(|v| !v.is_empty()) {
            config.user_agent = ua;
        }

        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid base_url '{}': {}", self.base_url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Unsupported base_url scheme '{}': expected http or https",
                url.scheme()
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be greater than zero".into()));
        }
        Ok(())
    }

    /// Absolute URL for an API path such as `/auth/me`.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}
