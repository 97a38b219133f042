use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Something worth telling operators about. Emitting logs it and records metrics.
pub trait InternalEvent: Sized {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit();
}

#[derive(Debug)]
pub struct RateLimitWaiting {
    pub wait: Duration,
}

impl InternalEvent for RateLimitWaiting {
    fn emit(self) {
        debug!(
            target: "api_dispatch::limiter",
            wait_ms = self.wait.as_millis() as u64,
            "Rate limit budget exhausted; waiting for next window."
        );
        counter!("api_dispatch_rate_limit_waits_total").increment(1);
        histogram!("api_dispatch_rate_limit_wait_seconds").record(self.wait);
    }
}

#[derive(Debug)]
pub struct RateLimitGranted {
    pub remaining: u32,
}

impl InternalEvent for RateLimitGranted {
    fn emit(self) {
        trace!(
            target: "api_dispatch::limiter",
            remaining = self.remaining,
            "Rate limit budget granted."
        );
        gauge!("api_dispatch_rate_limit_remaining").set(self.remaining as f64);
    }
}

#[derive(Debug)]
pub struct RequestCompleted<'a> {
    pub url: &'a str,
    pub status: u16,
    pub elapsed: Duration,
}

impl InternalEvent for RequestCompleted<'_> {
    fn emit(self) {
        debug!(
            target: "api_dispatch::dispatcher",
            url = %self.url,
            status = self.status,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Request completed."
        );
        counter!("api_dispatch_requests_total", "status" => self.status.to_string())
            .increment(1);
        histogram!("api_dispatch_request_duration_seconds").record(self.elapsed);
    }
}

#[derive(Debug)]
pub struct UpstreamRateLimited<'a> {
    pub url: &'a str,
}

impl InternalEvent for UpstreamRateLimited<'_> {
    fn emit(self) {
        warn!(
            target: "api_dispatch::dispatcher",
            url = %self.url,
            "Upstream rate limit exceeded (HTTP 429); local budget left unchanged."
        );
        counter!("api_dispatch_upstream_rate_limited_total").increment(1);
    }
}

#[derive(Debug)]
pub struct TransportFailed<'a> {
    pub url: &'a str,
    pub error: &'a crate::http::HttpError,
}

impl InternalEvent for TransportFailed<'_> {
    fn emit(self) {
        error!(
            target: "api_dispatch::dispatcher",
            url = %self.url,
            error = %self.error,
            "Request failed after retry."
        );
        counter!("api_dispatch_transport_errors_total").increment(1);
    }
}

#[derive(Debug)]
pub struct EventPublished<'a> {
    pub topic: &'a str,
}

impl InternalEvent for EventPublished<'_> {
    fn emit(self) {
        trace!(target: "api_dispatch::events", topic = %self.topic, "Event published.");
        counter!("api_dispatch_events_published_total").increment(1);
    }
}

#[derive(Debug)]
pub struct EventDropped<'a> {
    pub topic: &'a str,
    pub reason: &'static str,
}

impl InternalEvent for EventDropped<'_> {
    fn emit(self) {
        debug!(
            target: "api_dispatch::events",
            topic = %self.topic,
            reason = self.reason,
            "Event dropped."
        );
        counter!("api_dispatch_events_dropped_total").increment(1);
    }
}

#[derive(Debug)]
pub struct EventHandlerFailed<'a> {
    pub topic: &'a str,
    pub handler: usize,
    pub error: &'a (dyn std::error::Error + Send + Sync),
}

impl InternalEvent for EventHandlerFailed<'_> {
    fn emit(self) {
        error!(
            target: "api_dispatch::events",
            topic = %self.topic,
            handler = self.handler,
            error = %self.error,
            "Event handler failed."
        );
        counter!("api_dispatch_event_handler_errors_total", "topic" => self.topic.to_string())
            .increment(1);
    }
}
