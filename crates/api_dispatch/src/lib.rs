//! Rate-limited request dispatch for read-only JSON/REST APIs.
//!
//! This crate provides the pieces an API client needs to talk to a single
//! upstream host that enforces a request quota:
//!
//! 1. **[`limiter::RateLimiter`]**: a fixed-window budget shared by every
//!    in-flight request. Callers suspend until a unit of budget is available.
//! 2. **[`endpoint::EndpointTree`]**: the hierarchical endpoint namespace,
//!    resolving ordered path segments into full request URLs.
//! 3. **[`dispatcher::Dispatcher`]**: acquires budget, sends the request
//!    through a `tower` stack (rate limit, one transport retry, reqwest) and
//!    classifies the outcome.
//! 4. **[`events::EventBus`]**: an optional fan-out of successful responses
//!    to handlers registered per topic.
//!
//! # Window semantics
//! The limiter uses a fixed window with lazy rollover. A burst of up to
//! `2 × capacity` requests can straddle a window boundary; the client cannot
//! synchronize with the server clock, so this approximation is accepted.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use api_dispatch::dispatcher::{Dispatcher, DispatcherSettings};
//! use api_dispatch::endpoint::EndpointTree;
//! use api_dispatch::limiter::RateLimiter;
//! use api_dispatch::reqwest_integration::ReqwestService;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let tree = EndpointTree::new("https://api.example.com/v1/")?;
//! let limiter = Arc::new(RateLimiter::new(120, Duration::from_secs(60))?);
//! let settings = DispatcherSettings::builder().api_key("secret").build();
//! let dispatcher = Dispatcher::new(settings, limiter, ReqwestService::new(), None);
//!
//! let endpoint = tree.resolve(["series", "observations"])?;
//! let response = dispatcher
//!     .call(&endpoint, http::Method::GET, vec![("series_id".into(), "GDP".into())], None)
//!     .await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics and structured logs via the [`internal_event::InternalEvent`] trait.
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod http;
pub mod internal_event;
pub mod limiter;
pub mod reqwest_integration;
pub mod retries;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
