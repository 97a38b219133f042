use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tower::Service;

use crate::http::{ApiRequest, ApiResponse, HttpError, redact};
use crate::internal_event::{RequestCompleted, emit};

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Every HTTP status is a successful call at this layer; only failures to
/// obtain a response at all become [`HttpError`]s.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
    secret_param: Option<String>,
}

impl ReqwestService {
    pub fn new() -> Self {
        Self::new_with_client(reqwest::Client::new())
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            secret_param: None,
        }
    }

    /// Builds a client whose requests time out after `timeout` unless the
    /// request carries its own.
    pub fn with_timeout(
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self::new_with_client(builder.build()?))
    }

    /// Query parameter whose value is masked whenever a URL is logged.
    pub fn masking(mut self, param: impl Into<String>) -> Self {
        self.secret_param = Some(param.into());
        self
    }

    fn loggable(&self, request: &ApiRequest) -> String {
        match &self.secret_param {
            Some(param) => redact(&request.url, param),
            None => request.url.to_string(),
        }
    }
}

impl Default for ReqwestService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ApiRequest> for ReqwestService {
    type Response = ApiResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let loggable = self.loggable(&request);
        let mut builder = self.client.request(request.method, request.url);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        Box::pin(async move {
            let started = Instant::now();
            trace!(url = %loggable, "Sending request.");

            let response = builder.send().await.map_err(|e| classify(e, &loggable))?;
            let url = response.url().clone();
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| classify(e, &loggable))?;

            emit(RequestCompleted {
                url: &loggable,
                status: status.as_u16(),
                elapsed: started.elapsed(),
            });
            Ok(ApiResponse::new(url, status, headers, body))
        })
    }
}

fn classify(error: reqwest::Error, url: &str) -> HttpError {
    // reqwest echoes the request URL, key included, in its Display output.
    let error = error.without_url();
    if error.is_timeout() {
        warn!(url = %url, error = %error, "Request timed out");
        HttpError::Timeout
    } else if error.is_builder() {
        error!(url = %url, error = %error, "Invalid request");
        HttpError::InvalidRequest {
            details: error.to_string(),
        }
    } else {
        warn!(url = %url, error = %error, "Transport error");
        HttpError::Transport {
            source: Box::new(error),
        }
    }
}
