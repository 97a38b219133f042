//! Synchronous facade over [`ApiClient`].
//!
//! The facade owns a current-thread runtime. Requests, and any event handlers
//! they trigger, only make progress while one of its methods is running, so
//! call [`BlockingApiClient::close`] before dropping it to let handlers
//! finish.

use api_dispatch::Error as HandlerError;
use api_dispatch::events::Event;
use api_dispatch::http::{ApiResponse, Params};
use serde_json::Value;
use snafu::ResultExt;
use tokio::runtime::{Builder, Runtime};

use crate::client::ApiClient;
use crate::config::FredConfig;
use crate::error::{FredError, RuntimeSnafu};

#[derive(Debug)]
pub struct BlockingApiClient {
    runtime: Runtime,
    client: ApiClient,
}

impl BlockingApiClient {
    /// Must not be called from within an asynchronous context.
    pub fn new(config: FredConfig) -> Result<Self, FredError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context(RuntimeSnafu)?;
        let client = {
            let _guard = runtime.enter();
            ApiClient::new(config)?
        };
        Ok(Self { runtime, client })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn get(&self, path: &str, params: Params) -> Result<ApiResponse, FredError> {
        let endpoint = self.client.endpoint(path)?;
        self.runtime.block_on(endpoint.get(params))
    }

    pub fn get_json(&self, path: &str, params: Params) -> Result<Value, FredError> {
        let endpoint = self.client.endpoint(path)?;
        self.runtime.block_on(endpoint.get_json(params))
    }

    pub fn get_all(&self, path: &str, params: Params) -> Result<Vec<Value>, FredError> {
        let endpoint = self.client.endpoint(path)?;
        self.runtime.block_on(endpoint.get_all(params))
    }

    pub fn subscribe_fn<F, E>(
        &self,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<usize, FredError>
    where
        F: Fn(&Event<ApiResponse>) -> Result<(), E> + Send + Sync + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        self.client.subscribe_fn(topic, handler)
    }

    /// Closes the client and drives queued event handlers to completion.
    pub fn close(&self) {
        self.runtime.block_on(self.client.close());
    }
}
