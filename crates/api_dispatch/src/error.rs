use std::time::Duration;

use ::http::StatusCode;
use snafu::Snafu;

use crate::http::{ApiResponse, HttpError};

/// Invalid construction parameters. Fatal and never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("rate limit capacity must be at least 1"))]
    ZeroCapacity,

    #[snafu(display("rate limit capacity must be between 1 and {max}, got {capacity}"))]
    InvalidCapacity { capacity: u32, max: u32 },

    #[snafu(display("rate limit window must be non-zero, got {window:?}"))]
    InvalidWindow { window: Duration },

    #[snafu(display("invalid base URL '{url}': {source}"))]
    InvalidBaseUrl {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("base URL '{url}' cannot carry path segments"))]
    BaseUrlCannotBeABase { url: String },

    #[snafu(display("an API key must be provided"))]
    MissingApiKey,

    #[snafu(display("failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
}

/// Failure of a single logical request, returned to that request's caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    /// Connection, DNS or timeout failure that persisted after the retry.
    #[snafu(display("request failed: {source}"))]
    Transport { source: HttpError },

    /// Upstream answered with a non-success status other than 429.
    #[snafu(display("upstream returned {}: {}", response.status(), truncate(&response.text())))]
    Upstream { response: ApiResponse },

    /// Upstream answered 429. The local limiter is left untouched.
    #[snafu(display("upstream rate limit exceeded ({})", response.url().path()))]
    RateLimited { response: ApiResponse },

    /// The client was closed before or while the request waited for budget.
    #[snafu(display("client closed"))]
    Closed,

    /// A call was spawned outside a Tokio runtime.
    #[snafu(display("no Tokio runtime to drive the request: {source}"))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },

    /// The task driving a spawned call panicked or was cancelled.
    #[snafu(display("request task aborted: {source}"))]
    Aborted { source: tokio::task::JoinError },
}

impl DispatchError {
    /// The upstream response behind this error, if there was one.
    pub fn response(&self) -> Option<&ApiResponse> {
        match self {
            DispatchError::Upstream { response } | DispatchError::RateLimited { response } => {
                Some(response)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(ApiResponse::status)
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, DispatchError::RateLimited { .. })
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, DispatchError::Closed)
    }
}

impl From<HttpError> for DispatchError {
    fn from(source: HttpError) -> Self {
        match source {
            HttpError::Closed => DispatchError::Closed,
            source => DispatchError::Transport { source },
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
