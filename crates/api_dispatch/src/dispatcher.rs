//! Sends requests to resolved endpoints under the shared rate limit.
//!
//! A call flows through this `tower` stack:
//!
//! ```text
//! Retry(FixedBackoffPolicy) ─► RateLimited(limiter.acquire) ─► transport (reqwest)
//! ```
//!
//! The limiter sits inside the retry layer, so a retried attempt consumes a
//! unit of budget like any other request. A connection or timeout failure is
//! retried at most once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ::http::{Method, StatusCode};
use bon::Builder;
use futures::future::BoxFuture;
use pin_project::pin_project;
use snafu::ResultExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tower::retry::{Retry, RetryLayer};
use tower::{Layer, Service, ServiceBuilder, ServiceExt};
use url::Url;

use crate::endpoint::Endpoint;
use crate::error::{DispatchError, NoRuntimeSnafu, RateLimitedSnafu, UpstreamSnafu};
use crate::events::EventBus;
use crate::http::{ApiRequest, ApiResponse, HttpError, Params, redact};
use crate::internal_event::{TransportFailed, UpstreamRateLimited, emit};
use crate::limiter::RateLimiter;
use crate::reqwest_integration::ReqwestService;
use crate::retries::{FixedBackoffPolicy, TransportRetryLogic};

/// Request construction and retry settings for a [`Dispatcher`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `api_key_param` | `"api_key"` | Query parameter carrying the key. Its value is masked in logs. |
/// | `api_key` | none | Appended to every request when set. |
/// | `default_params` | empty | Appended to every request. A caller parameter with the same name wins. |
/// | `request_timeout` | none | Per-request timeout unless the call overrides it. |
/// | `retry_backoff` | 500ms | Delay before the single retry of a failed attempt. |
///
/// ```rust
/// use api_dispatch::dispatcher::DispatcherSettings;
///
/// let settings = DispatcherSettings::builder()
///     .api_key("secret")
///     .default_params(vec![("file_type".into(), "json".into())])
///     .build();
/// assert_eq!(settings.api_key_param(), "api_key");
/// ```
#[derive(Clone, Builder)]
pub struct DispatcherSettings {
    #[builder(into, default = "api_key".to_string())]
    api_key_param: String,

    #[builder(into)]
    api_key: Option<String>,

    #[builder(default)]
    default_params: Params,

    request_timeout: Option<Duration>,

    #[builder(default = Duration::from_millis(500))]
    retry_backoff: Duration,
}

impl DispatcherSettings {
    pub fn api_key_param(&self) -> &str {
        &self.api_key_param
    }

    pub fn default_params(&self) -> &Params {
        &self.default_params
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Full request URL: key first, then defaults, then caller parameters.
    pub fn request_url(&self, base: &Url, params: &[(String, String)]) -> Url {
        let mut pairs: Vec<(&str, &str)> =
            Vec::with_capacity(1 + self.default_params.len() + params.len());
        if let Some(key) = &self.api_key {
            pairs.push((self.api_key_param.as_str(), key.as_str()));
        }
        pairs.extend(
            self.default_params
                .iter()
                .filter(|(name, _)| !params.iter().any(|(given, _)| given == name))
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );
        pairs.extend(
            params
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );

        let mut url = base.clone();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        url
    }
}

impl fmt::Debug for DispatcherSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherSettings")
            .field("api_key_param", &self.api_key_param)
            .field("api_key", &self.api_key.as_ref().map(|_| "<masked>"))
            .field("default_params", &self.default_params)
            .field("request_timeout", &self.request_timeout)
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}

/// Applies [`RateLimited`] to a service.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimited<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimited {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Holds every request until the shared limiter grants it a unit of budget.
#[derive(Clone, Debug)]
pub struct RateLimited<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S, Req> Service<Req> for RateLimited<S>
where
    S: Service<Req, Error = HttpError> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<S::Response, HttpError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        // Move the service that was polled ready into the future.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);

        Box::pin(async move {
            limiter.acquire().await.map_err(|_| HttpError::Closed)?;
            inner.call(request).await
        })
    }
}

/// A transport the dispatcher can drive: any cloneable service from
/// [`ApiRequest`] to [`ApiResponse`].
pub trait Transport:
    Service<ApiRequest, Response = ApiResponse, Error = HttpError, Future: Send>
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> Transport for T where
    T: Service<ApiRequest, Response = ApiResponse, Error = HttpError, Future: Send>
        + Clone
        + Send
        + Sync
        + 'static
{
}

/// Attempts after the first for a connection or timeout failure.
pub const MAX_RETRIES: usize = 1;

type Stack<T> = Retry<FixedBackoffPolicy<TransportRetryLogic>, RateLimited<T>>;

struct Inner<T> {
    service: Stack<T>,
    settings: DispatcherSettings,
    limiter: Arc<RateLimiter>,
    events: Option<EventBus<ApiResponse>>,
}

/// Shared handle for issuing requests. Cheap to clone.
pub struct Dispatcher<T = ReqwestService> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.inner.settings)
            .field("limiter", &self.inner.limiter)
            .field("events", &self.inner.events.is_some())
            .finish()
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Responses are published to `events`, when given, under the final path
    /// segment of the endpoint they came from.
    pub fn new(
        settings: DispatcherSettings,
        limiter: Arc<RateLimiter>,
        transport: T,
        events: Option<EventBus<ApiResponse>>,
    ) -> Self {
        let policy =
            FixedBackoffPolicy::new(MAX_RETRIES, settings.retry_backoff, TransportRetryLogic);
        let service = ServiceBuilder::new()
            .layer(RetryLayer::new(policy))
            .layer(RateLimitLayer::new(Arc::clone(&limiter)))
            .service(transport);

        Self {
            inner: Arc::new(Inner {
                service,
                settings,
                limiter,
                events,
            }),
        }
    }

    /// Issues one logical request and waits for its outcome.
    ///
    /// Only a 2xx response is `Ok`. A 429 becomes
    /// [`DispatchError::RateLimited`] and any other status
    /// [`DispatchError::Upstream`]; both carry the full response.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        method: Method,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse, DispatchError> {
        if self.inner.limiter.is_closed() {
            return Err(DispatchError::Closed);
        }

        let settings = &self.inner.settings;
        let url = settings.request_url(endpoint.url(), &params);
        let loggable = redact(&url, &settings.api_key_param);
        let request = ApiRequest {
            method,
            url,
            timeout: timeout.or(settings.request_timeout),
        };
        debug!(target: "api_dispatch::dispatcher", url = %loggable, "Dispatching request.");

        let response = match self.inner.service.clone().oneshot(request).await {
            Ok(response) => response,
            Err(error) => {
                if !matches!(error, HttpError::Closed) {
                    emit(TransportFailed {
                        url: &loggable,
                        error: &error,
                    });
                }
                return Err(error.into());
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            emit(UpstreamRateLimited { url: &loggable });
            return RateLimitedSnafu { response }.fail();
        }
        if !status.is_success() {
            warn!(
                target: "api_dispatch::dispatcher",
                url = %loggable,
                status = status.as_u16(),
                body = %response.text().chars().take(200).collect::<String>(),
                "Upstream returned an error status."
            );
            return UpstreamSnafu { response }.fail();
        }

        if let Some(events) = &self.inner.events {
            events.publish(endpoint.topic(), response.clone());
        }
        Ok(response)
    }

    /// Starts the request on the current Tokio runtime and returns
    /// immediately.
    ///
    /// Fails with [`DispatchError::NoRuntime`] when called outside a runtime;
    /// no budget is consumed in that case.
    pub fn spawn(
        &self,
        endpoint: Endpoint,
        method: Method,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, DispatchError> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu)?;
        let dispatcher = self.clone();
        Ok(PendingCall {
            handle: runtime.spawn(async move {
                dispatcher.call(&endpoint, method, params, timeout).await
            }),
        })
    }
}

impl<T> Dispatcher<T> {
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn events(&self) -> Option<&EventBus<ApiResponse>> {
        self.inner.events.as_ref()
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.limiter.is_closed()
    }

    /// Rejects requests still waiting for budget and every later call, then
    /// drains the event bus. Requests already on the wire run to completion.
    pub async fn close(&self) {
        if !self.inner.limiter.is_closed() {
            info!(target: "api_dispatch::dispatcher", "Closing dispatcher.");
        }
        self.inner.limiter.close();
        if let Some(events) = &self.inner.events {
            events.stop().await;
        }
    }
}

/// Outcome of a request started with [`Dispatcher::spawn`].
#[pin_project]
#[derive(Debug)]
pub struct PendingCall {
    #[pin]
    handle: JoinHandle<Result<ApiResponse, DispatchError>>,
}

impl PendingCall {
    /// Cancels the request. Awaiting afterwards yields [`DispatchError::Aborted`].
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingCall {
    type Output = Result<ApiResponse, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match std::task::ready!(self.project().handle.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(source) => Poll::Ready(Err(DispatchError::Aborted { source })),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ::http::HeaderMap;
    use bytes::Bytes;
    use tokio_test::{assert_pending, assert_ready, task};
    use tower::util::MapErr;
    use tower_test::mock;

    use super::*;
    use crate::Error;
    use crate::endpoint::EndpointTree;
    use crate::test_utils::trace_init;

    type MockTransport = MapErr<mock::Mock<ApiRequest, ApiResponse>, fn(Error) -> HttpError>;
    type MockHandle = mock::Handle<ApiRequest, ApiResponse>;

    fn into_http_error(error: Error) -> HttpError {
        match error.downcast::<HttpError>() {
            Ok(error) => *error,
            Err(source) => HttpError::Transport { source },
        }
    }

    fn setup(
        events: Option<EventBus<ApiResponse>>,
    ) -> (Dispatcher<MockTransport>, MockHandle, Endpoint) {
        trace_init();
        let (service, handle) = mock::pair::<ApiRequest, ApiResponse>();
        let transport: MockTransport = service.map_err(into_http_error as fn(Error) -> HttpError);
        let settings = DispatcherSettings::builder()
            .api_key("k")
            .default_params(vec![("file_type".into(), "json".into())])
            .build();
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)).unwrap());
        let tree = EndpointTree::new("https://host/api").unwrap();
        let endpoint = tree.resolve(["series", "observations"]).unwrap();
        (Dispatcher::new(settings, limiter, transport, events), handle, endpoint)
    }

    fn reply(request: &ApiRequest, status: StatusCode, body: &'static str) -> ApiResponse {
        ApiResponse::new(
            request.url.clone(),
            status,
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    fn series(id: &str) -> Params {
        vec![("series_id".into(), id.into())]
    }

    #[tokio::test(start_paused = true)]
    async fn success_consumes_one_unit_and_is_published() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn("observations", move |event: &crate::events::Event<ApiResponse>| {
                seen.lock().unwrap().push(event.payload().text());
                Ok::<_, Error>(())
            });
        }
        bus.start().unwrap();
        let (dispatcher, mut handle, endpoint) = setup(Some(bus));

        let call = dispatcher
            .spawn(endpoint, Method::GET, series("GDP"), None)
            .unwrap();
        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://host/api/series/observations?api_key=k&file_type=json&series_id=GDP"
        );
        send.send_response(reply(&request, StatusCode::OK, r#"{"count":1}"#));

        let response = call.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(dispatcher.limiter().remaining(), 9);

        dispatcher.close().await;
        assert_eq!(*seen.lock().unwrap(), [r#"{"count":1}"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_requests_is_returned_without_retry() {
        let (dispatcher, mut handle, endpoint) = setup(None);

        let call = dispatcher
            .spawn(endpoint, Method::GET, series("GDP"), None)
            .unwrap();
        let (request, send) = handle.next_request().await.unwrap();
        send.send_response(reply(&request, StatusCode::TOO_MANY_REQUESTS, "slow down"));

        let error = call.await.unwrap_err();
        assert!(error.is_rate_limited());
        assert_eq!(error.status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(dispatcher.limiter().remaining(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_carries_the_response() {
        let (dispatcher, mut handle, endpoint) = setup(None);

        let call = dispatcher
            .spawn(endpoint, Method::GET, series("GDP"), None)
            .unwrap();
        let (request, send) = handle.next_request().await.unwrap();
        send.send_response(reply(&request, StatusCode::INTERNAL_SERVER_ERROR, "oops"));

        match call.await {
            Err(DispatchError::Upstream { response }) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(response.text(), "oops");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dispatcher.limiter().remaining(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_retried_once() {
        let (dispatcher, mut handle, endpoint) = setup(None);

        let call = dispatcher
            .spawn(endpoint, Method::GET, series("GDP"), None)
            .unwrap();
        let (_, send) = handle.next_request().await.unwrap();
        send.send_error(HttpError::Timeout);

        let (_, send) = handle.next_request().await.unwrap();
        send.send_error(HttpError::Timeout);

        assert!(matches!(
            call.await,
            Err(DispatchError::Transport {
                source: HttpError::Timeout
            })
        ));
        // Each attempt takes its own unit of budget.
        assert_eq!(dispatcher.limiter().remaining(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_can_recover() {
        let (dispatcher, mut handle, endpoint) = setup(None);

        let call = dispatcher
            .spawn(endpoint, Method::GET, series("GDP"), None)
            .unwrap();
        let (_, send) = handle.next_request().await.unwrap();
        send.send_error(HttpError::Transport {
            source: "connection refused".into(),
        });

        let (request, send) = handle.next_request().await.unwrap();
        send.send_response(reply(&request, StatusCode::OK, "{}"));
        assert!(call.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_dispatcher_rejects_calls() {
        let (dispatcher, _handle, endpoint) = setup(None);
        dispatcher.close().await;

        let outcome = dispatcher
            .call(&endpoint, Method::GET, series("GDP"), None)
            .await;
        assert!(outcome.unwrap_err().is_closed());
        assert!(dispatcher.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn call_waiting_for_budget_is_rejected_on_close() {
        let (dispatcher, mut handle, endpoint) = setup(None);
        for _ in 0..10 {
            dispatcher.limiter().acquire().await.unwrap();
        }

        let mut call = task::spawn(dispatcher.call(&endpoint, Method::GET, series("GDP"), None));
        assert_pending!(call.poll());

        dispatcher.close().await;
        assert!(call.is_woken());
        assert!(matches!(assert_ready!(call.poll()), Err(DispatchError::Closed)));
        drop(call);

        // The waiting call never reached the transport.
        assert_pending!(task::spawn(handle.next_request()).poll());
    }

    #[test]
    fn spawn_requires_a_runtime() {
        let (dispatcher, _handle, endpoint) = setup(None);

        let outcome = dispatcher.spawn(endpoint, Method::GET, series("GDP"), None);
        assert!(matches!(outcome, Err(DispatchError::NoRuntime { .. })));
        assert_eq!(dispatcher.limiter().remaining(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_overrides_default() {
        let (dispatcher, mut handle, endpoint) = setup(None);

        let call = dispatcher
            .spawn(
                endpoint,
                Method::GET,
                Params::new(),
                Some(Duration::from_secs(3)),
            )
            .unwrap();
        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
        send.send_response(reply(&request, StatusCode::OK, "{}"));
        call.await.unwrap();
    }

    #[test]
    fn caller_params_override_defaults() {
        let settings = DispatcherSettings::builder()
            .api_key("k")
            .default_params(vec![("file_type".into(), "json".into())])
            .build();
        let base = Url::parse("https://host/api/series").unwrap();

        let overrides: Params = vec![("file_type".into(), "xml".into())];
        let url = settings.request_url(&base, &overrides);
        assert_eq!(
            url.as_str(),
            "https://host/api/series?api_key=k&file_type=xml"
        );

        let bare = DispatcherSettings::builder().build();
        assert_eq!(
            bare.request_url(&base, &[]).as_str(),
            "https://host/api/series"
        );
    }

    #[test]
    fn settings_debug_masks_the_key() {
        let settings = DispatcherSettings::builder().api_key("hunter2").build();
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
