use api_dispatch::endpoint::EndpointError;
use api_dispatch::error::{ConfigError, DispatchError};
use api_dispatch::events::BusError;
use http::StatusCode;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FredError {
    #[snafu(display("invalid client configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("environment variable {name} has invalid value '{value}'"))]
    InvalidEnvVar { name: String, value: String },

    #[snafu(display("{source}"))]
    Endpoint { source: EndpointError },

    #[snafu(display("request to '{path}' failed: {source}"))]
    Request { path: String, source: DispatchError },

    #[snafu(display("response from '{path}' is not valid JSON: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("events are disabled for this client"))]
    EventsDisabled,

    #[snafu(display("event bus unavailable: {source}"))]
    Bus { source: BusError },

    #[snafu(display("failed to build runtime: {source}"))]
    Runtime { source: std::io::Error },
}

impl FredError {
    /// Status of the upstream response that caused this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FredError::Request { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FredError::Request { source, .. } if source.is_rate_limited())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, FredError::Request { source, .. } if source.is_closed())
    }
}

impl From<ConfigError> for FredError {
    fn from(source: ConfigError) -> Self {
        FredError::Config { source }
    }
}

impl From<EndpointError> for FredError {
    fn from(source: EndpointError) -> Self {
        FredError::Endpoint { source }
    }
}

impl From<BusError> for FredError {
    fn from(source: BusError) -> Self {
        FredError::Bus { source }
    }
}
