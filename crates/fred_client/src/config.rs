use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::endpoints::{FRED_API_RATE_LIMIT, FRED_API_RATE_RESET, FRED_API_URL};
use crate::error::FredError;

const ENV_API_KEY: &str = "FRED_API_KEY";
const ENV_RATE_LIMIT: &str = "FRED_RATE_LIMIT";
const ENV_ENABLE_EVENTS: &str = "FRED_ENABLE_EVENTS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "FRED_REQUEST_TIMEOUT_SECS";

/// Settings for an [`ApiClient`](crate::ApiClient).
///
/// Missing fields take their defaults when deserialized, so a config file
/// only needs to carry what it changes.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FredConfig {
    /// Required by the upstream API. See [`FredConfig::from_env`].
    pub api_key: Option<String>,
    pub base_url: String,
    /// Requests per window. May not exceed the upstream limit of 120.
    pub rate_limit_capacity: u32,
    pub rate_limit_window_secs: u64,
    /// Publish every successful response to subscribed handlers.
    pub enable_events: bool,
    pub request_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for FredConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: FRED_API_URL.to_string(),
            rate_limit_capacity: FRED_API_RATE_LIMIT,
            rate_limit_window_secs: FRED_API_RATE_RESET.as_secs(),
            enable_events: false,
            request_timeout_secs: 30,
            retry_backoff_ms: 500,
            user_agent: Some(format!("fred_client/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl fmt::Debug for FredConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FredConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<masked>"))
            .field("base_url", &self.base_url)
            .field("rate_limit_capacity", &self.rate_limit_capacity)
            .field("rate_limit_window_secs", &self.rate_limit_window_secs)
            .field("enable_events", &self.enable_events)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl FredConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Defaults overridden by `FRED_API_KEY`, `FRED_RATE_LIMIT`,
    /// `FRED_ENABLE_EVENTS` and `FRED_REQUEST_TIMEOUT_SECS`. A `.env` file in
    /// the working directory is loaded first, if present.
    pub fn from_env() -> Result<Self, FredError> {
        if dotenvy::dotenv().is_ok() {
            debug!(target: "fred_client::config", "Loaded .env file.");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FredError> {
        let defaults = Self::default();
        Ok(Self {
            api_key: lookup(ENV_API_KEY).filter(|key| !key.is_empty()),
            rate_limit_capacity: parse_var(&lookup, ENV_RATE_LIMIT)?
                .unwrap_or(defaults.rate_limit_capacity),
            enable_events: parse_var(&lookup, ENV_ENABLE_EVENTS)?
                .unwrap_or(defaults.enable_events),
            request_timeout_secs: parse_var(&lookup, ENV_REQUEST_TIMEOUT_SECS)?
                .unwrap_or(defaults.request_timeout_secs),
            ..defaults
        })
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, FredError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FredError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
    }
}
