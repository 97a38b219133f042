use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_dispatch::Error as HandlerError;
use api_dispatch::dispatcher::{Dispatcher, DispatcherSettings, PendingCall};
use api_dispatch::endpoint::{Endpoint, EndpointTree, SEPARATOR};
use api_dispatch::error::ConfigError;
use api_dispatch::events::{Event, EventBus};
use api_dispatch::http::{ApiResponse, Params};
use api_dispatch::limiter::RateLimiter;
use api_dispatch::reqwest_integration::ReqwestService;
use futures::future::try_join_all;
use http::Method;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info};
use url::Url;

use crate::config::FredConfig;
use crate::endpoints::{
    FRED_API_ENDPOINTS, FRED_API_FILE_TYPE, FRED_API_KEY_PARAM, FRED_API_RATE_LIMIT, doc_url,
};
use crate::error::{DecodeSnafu, EventsDisabledSnafu, FredError, RequestSnafu};

/// Builds [`Params`] from anything that yields name/value pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

/// Entry point to the FRED API. Cheap to clone; clones share the rate limit.
#[derive(Clone)]
pub struct ApiClient {
    tree: Arc<EndpointTree>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.tree.base().as_str())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ApiClient {
    /// Builds the client. When events are enabled the event bus is started
    /// right away, which requires a Tokio runtime context.
    pub fn new(config: FredConfig) -> Result<Self, FredError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;
        let capacity = config.rate_limit_capacity;
        if capacity == 0 || capacity > FRED_API_RATE_LIMIT {
            return Err(ConfigError::InvalidCapacity {
                capacity,
                max: FRED_API_RATE_LIMIT,
            }
            .into());
        }

        let limiter = Arc::new(RateLimiter::new(capacity, config.rate_limit_window())?);
        let tree = EndpointTree::new(&config.base_url)?;
        tree.add_endpoints(FRED_API_ENDPOINTS)?;

        let transport =
            ReqwestService::with_timeout(config.request_timeout(), config.user_agent.as_deref())
                .map_err(|source| ConfigError::BuildClient { source })?
                .masking(FRED_API_KEY_PARAM);

        let events = if config.enable_events {
            let bus = EventBus::new();
            bus.start()?;
            Some(bus)
        } else {
            None
        };

        let settings = DispatcherSettings::builder()
            .api_key_param(FRED_API_KEY_PARAM)
            .api_key(api_key)
            .default_params(params([("file_type", FRED_API_FILE_TYPE)]))
            .retry_backoff(config.retry_backoff())
            .build();
        let dispatcher = Dispatcher::new(settings, limiter, transport, events);

        info!(
            target: "fred_client",
            base_url = %tree.base(),
            rate_limit = capacity,
            window_secs = config.rate_limit_window_secs,
            events = config.enable_events,
            "FRED client initialized."
        );
        debug!(target: "fred_client", client_config = ?config, "Full client configuration.");

        Ok(Self {
            tree: Arc::new(tree),
            dispatcher,
        })
    }

    /// Handle for a `/`-delimited path such as `series/observations`.
    /// Paths outside the known FRED namespace are accepted as well.
    pub fn endpoint(&self, path: &str) -> Result<EndpointHandle, FredError> {
        let endpoint = self.tree.resolve_path(path)?;
        Ok(self.handle(endpoint))
    }

    /// Handle for the base URL itself.
    pub fn root(&self) -> EndpointHandle {
        self.handle(self.tree.root_endpoint())
    }

    /// Every known endpoint URL, depth-first.
    pub fn endpoints(&self) -> Vec<Url> {
        self.tree.endpoints()
    }

    /// Registers an asynchronous handler for responses from endpoints whose
    /// final path segment is `topic`.
    pub fn subscribe<F, Fut, E>(
        &self,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<usize, FredError>
    where
        F: Fn(Arc<Event<ApiResponse>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + 'static,
    {
        Ok(self.events()?.subscribe(topic, handler))
    }

    /// Registers a synchronous handler. See [`subscribe`](Self::subscribe).
    pub fn subscribe_fn<F, E>(
        &self,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<usize, FredError>
    where
        F: Fn(&Event<ApiResponse>) -> Result<(), E> + Send + Sync + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        Ok(self.events()?.subscribe_fn(topic, handler))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.dispatcher.limiter()
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Rejects queued and future requests, then waits for every published
    /// event to be handled.
    pub async fn close(&self) {
        self.dispatcher.close().await;
        info!(target: "fred_client", "FRED client closed.");
    }

    fn events(&self) -> Result<&EventBus<ApiResponse>, FredError> {
        self.dispatcher.events().context(EventsDisabledSnafu)
    }

    fn handle(&self, endpoint: Endpoint) -> EndpointHandle {
        EndpointHandle {
            client: self.clone(),
            endpoint,
            timeout: None,
        }
    }
}

/// A single endpoint, with methods to request it.
#[derive(Clone)]
pub struct EndpointHandle {
    client: ApiClient,
    endpoint: Endpoint,
    timeout: Option<Duration>,
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("url", &self.endpoint.url().as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl EndpointHandle {
    pub fn path(&self) -> &str {
        self.endpoint.path()
    }

    pub fn url(&self) -> &Url {
        self.endpoint.url()
    }

    /// Topic under which responses from this endpoint are published.
    pub fn topic(&self) -> &str {
        self.endpoint.topic()
    }

    pub fn doc_url(&self) -> String {
        doc_url(self.path())
    }

    /// Bounds every attempt of every request made through this handle,
    /// overriding the client-wide `request_timeout_secs`. Children resolved
    /// from the returned handle inherit it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn child(&self, segment: &str) -> Result<EndpointHandle, FredError> {
        let segments = self
            .path()
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .chain(std::iter::once(segment));
        let endpoint = self.client.tree.resolve(segments)?;
        Ok(self.related(endpoint))
    }

    pub fn children(&self) -> Vec<EndpointHandle> {
        self.endpoint
            .node()
            .children()
            .iter()
            .filter_map(|node| self.client.tree.get(node.full_path()))
            .map(|endpoint| self.related(endpoint))
            .collect()
    }

    pub async fn get(&self, params: Params) -> Result<ApiResponse, FredError> {
        self.client
            .dispatcher
            .call(&self.endpoint, Method::GET, params, self.timeout)
            .await
            .context(RequestSnafu { path: self.path() })
    }

    pub async fn get_json(&self, params: Params) -> Result<Value, FredError> {
        let response = self.get(params).await?;
        response.json().context(DecodeSnafu { path: self.path() })
    }

    /// Starts the request on the current Tokio runtime without waiting for
    /// it. Outside a runtime this fails instead of spawning.
    pub fn spawn_get(&self, params: Params) -> Result<PendingCall, FredError> {
        self.client
            .dispatcher
            .spawn(self.endpoint.clone(), Method::GET, params, self.timeout)
            .context(RequestSnafu { path: self.path() })
    }

    /// Fetches every page of a paginated result.
    ///
    /// The first page is requested alone. Its `count`, `limit` and `offset`
    /// fields determine the remaining offsets, which are then requested
    /// concurrently. Pages are returned in offset order.
    pub async fn get_all(&self, params: Params) -> Result<Vec<Value>, FredError> {
        let first = self.get_json(params.clone()).await?;
        let field = |name: &str| first.get(name).and_then(Value::as_u64).unwrap_or(0);
        let offsets = next_offsets(field("count"), field("limit"), field("offset"));
        if offsets.is_empty() {
            return Ok(vec![first]);
        }

        debug!(
            target: "fred_client",
            path = %self.path(),
            additional_requests = offsets.len(),
            "Fetching remaining pages."
        );
        let pages = offsets.into_iter().map(|offset| {
            let mut page_params: Params = params
                .iter()
                .filter(|(name, _)| name != "offset")
                .cloned()
                .collect();
            page_params.push(("offset".to_string(), offset.to_string()));
            self.get_json(page_params)
        });
        let rest = try_join_all(pages).await?;

        let mut results = Vec::with_capacity(rest.len() + 1);
        results.push(first);
        results.extend(rest);
        Ok(results)
    }

    fn related(&self, endpoint: Endpoint) -> EndpointHandle {
        EndpointHandle {
            client: self.client.clone(),
            endpoint,
            timeout: self.timeout,
        }
    }
}

/// Offsets of the pages after the one at `offset`.
pub(crate) fn next_offsets(count: u64, limit: u64, mut offset: u64) -> Vec<u64> {
    let mut offsets = Vec::new();
    if limit == 0 {
        return offsets;
    }
    while offset.saturating_add(limit) < count {
        offset += limit;
        offsets.push(offset);
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_step_by_limit_until_count() {
        assert_eq!(next_offsets(2500, 1000, 0), [1000, 2000]);
        assert_eq!(next_offsets(2000, 1000, 0), [1000]);
        assert_eq!(next_offsets(1000, 1000, 0), Vec::<u64>::new());
        assert_eq!(next_offsets(5, 2, 2), [4]);
    }

    #[test]
    fn zero_limit_yields_no_pages() {
        assert!(next_offsets(100, 0, 0).is_empty());
    }

    #[test]
    fn params_accepts_str_pairs() {
        assert_eq!(
            params([("series_id", "GDP")]),
            vec![("series_id".to_string(), "GDP".to_string())]
        );
    }

    #[tokio::test]
    async fn rejects_missing_key_and_excess_capacity() {
        assert!(matches!(
            ApiClient::new(FredConfig::default()),
            Err(FredError::Config {
                source: ConfigError::MissingApiKey
            })
        ));

        let config = FredConfig {
            rate_limit_capacity: 121,
            ..FredConfig::with_api_key("abc")
        };
        assert!(matches!(
            ApiClient::new(config),
            Err(FredError::Config {
                source: ConfigError::InvalidCapacity {
                    capacity: 121,
                    max: 120
                }
            })
        ));
    }

    #[tokio::test]
    async fn knows_every_fred_endpoint() {
        let client = ApiClient::new(FredConfig::with_api_key("abc")).unwrap();
        let urls = client.endpoints();
        assert_eq!(urls.len(), FRED_API_ENDPOINTS.len());
        let related_tags = "https://api.stlouisfed.org/fred/series/search/related_tags";
        assert!(urls.iter().any(|url| url.as_str() == related_tags));

        let series = client.endpoint("series").unwrap();
        let observations = series.child("observations").unwrap();
        assert_eq!(
            observations.url().as_str(),
            "https://api.stlouisfed.org/fred/series/observations"
        );
        assert_eq!(observations.topic(), "observations");
        assert_eq!(series.children().len(), 7);
        assert_eq!(client.root().children().len(), 8);
    }

    #[tokio::test]
    async fn timeout_is_inherited_by_children() {
        let client = ApiClient::new(FredConfig::with_api_key("abc")).unwrap();
        let series = client.endpoint("series").unwrap();
        assert_eq!(series.timeout(), None);

        let series = series.with_timeout(Duration::from_secs(2));
        let observations = series.child("observations").unwrap();
        assert_eq!(observations.timeout(), Some(Duration::from_secs(2)));
        assert!(
            series
                .children()
                .iter()
                .all(|child| child.timeout() == Some(Duration::from_secs(2)))
        );
    }

    #[tokio::test]
    async fn subscribing_requires_events() {
        let client = ApiClient::new(FredConfig::with_api_key("abc")).unwrap();
        let outcome =
            client.subscribe_fn("series", |_: &Event<ApiResponse>| Ok::<_, HandlerError>(()));
        assert!(matches!(outcome, Err(FredError::EventsDisabled)));
    }
}
