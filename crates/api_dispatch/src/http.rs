use std::time::Duration;

use ::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use snafu::Snafu;
use url::Url;

use crate::Error as CrateError;

/// Query parameters passed through to the upstream API unvalidated.
pub type Params = Vec<(String, String)>;

/// Errors produced by a transport service.
///
/// Only [`HttpError::Transport`] and [`HttpError::Timeout`] are retried by the
/// dispatcher; everything else is surfaced on the first occurrence.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., connection refused, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request was malformed before it could be sent.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The request did not complete within its timeout.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// The rate limiter was closed while the request waited for budget.
    #[snafu(display("client closed"))]
    Closed,
}

impl HttpError {
    pub const fn is_retriable(&self) -> bool {
        matches!(self, HttpError::Transport { .. } | HttpError::Timeout)
    }
}

/// Outbound request descriptor. Constructed per call and never retained.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Full URL including every query parameter.
    pub url: Url,
    /// Overrides the transport's default timeout for this request.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            timeout: None,
        }
    }
}

/// A fully buffered upstream response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Lossy UTF-8 view of the body, for diagnostics.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

const MASK: &str = "<masked>";

/// Renders `url` with the value of `secret_param` replaced, so it can be logged.
pub fn redact(url: &Url, secret_param: &str) -> String {
    if !url.query_pairs().any(|(k, _)| k == secret_param) {
        return url.to_string();
    }
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == secret_param {
                (k.into_owned(), MASK.to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}
