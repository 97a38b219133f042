//! Asynchronous client for the FRED economic data API.
//!
//! Requests share a budget of 120 per minute, the upstream limit, and each
//! endpoint is addressed by its path in the FRED namespace:
//!
//! ```no_run
//! use fred_client::{ApiClient, FredConfig, params};
//!
//! # async fn run() -> Result<(), fred_client::FredError> {
//! let client = ApiClient::new(FredConfig::from_env()?)?;
//! let pages = client
//!     .endpoint("series/observations")?
//!     .get_all(params([("series_id", "EFFR")]))
//!     .await?;
//! println!("fetched {} pages", pages.len());
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! With `enable_events` set, every successful response is also published to
//! handlers subscribed to the endpoint's final path segment, such as
//! `"observations"` for `series/observations`.

pub mod blocking;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;

pub use api_dispatch::events::Event;
pub use api_dispatch::http::{ApiResponse, Params};
pub use blocking::BlockingApiClient;
pub use client::{ApiClient, EndpointHandle, params};
pub use config::FredConfig;
pub use error::FredError;
