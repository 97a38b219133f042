use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::time::{Sleep, sleep};
use tower::retry::Policy;

use crate::http::HttpError;

/// Decides which service errors are worth another attempt.
///
/// Responses are never retried: an HTTP status, including 429, is an answer
/// from upstream and goes back to the caller as-is.
pub trait RetryLogic: Clone + Send + Sync + 'static {
    type Error: fmt::Display;

    fn is_retriable_error(&self, error: &Self::Error) -> bool;
}

/// Retries network-level failures (connect, DNS, timeout).
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportRetryLogic;

impl RetryLogic for TransportRetryLogic {
    type Error = HttpError;

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        error.is_retriable()
    }
}

/// A bounded number of retries separated by a constant delay.
#[derive(Debug, Clone)]
pub struct FixedBackoffPolicy<L> {
    remaining_attempts: usize,
    backoff: Duration,
    logic: L,
}

pub struct RetryPolicyFuture<L: RetryLogic> {
    delay: Pin<Box<Sleep>>,
    policy: FixedBackoffPolicy<L>,
}

impl<L: RetryLogic> FixedBackoffPolicy<L> {
    pub fn new(remaining_attempts: usize, backoff: Duration, logic: L) -> Self {
        Self {
            remaining_attempts,
            backoff,
            logic,
        }
    }

    pub const fn remaining_attempts(&self) -> usize {
        self.remaining_attempts
    }

    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    fn build_retry(&self) -> RetryPolicyFuture<L> {
        let policy = FixedBackoffPolicy {
            remaining_attempts: self.remaining_attempts - 1,
            backoff: self.backoff,
            logic: self.logic.clone(),
        };
        debug!(message = "Retrying request.", delay_ms = %self.backoff.as_millis());
        RetryPolicyFuture {
            delay: Box::pin(sleep(self.backoff)),
            policy,
        }
    }
}

impl<Req, Res, L> Policy<Req, Res, L::Error> for FixedBackoffPolicy<L>
where
    Req: Clone,
    L: RetryLogic,
{
    type Future = RetryPolicyFuture<L>;

    fn retry(&self, _: &Req, result: Result<&Res, &L::Error>) -> Option<Self::Future> {
        let error = result.err()?;

        if !self.logic.is_retriable_error(error) {
            debug!(message = "Non-retriable error.", %error);
            return None;
        }

        if self.remaining_attempts == 0 {
            error!(message = "Retries exhausted; giving up on the request.", %error);
            return None;
        }

        warn!(message = "Retrying after error.", %error);
        Some(self.build_retry())
    }

    fn clone_request(&self, request: &Req) -> Option<Req> {
        Some(request.clone())
    }
}

// Safety: `L` is never pinned and we use no unsafe pin projections
// therefore this safe.
impl<L: RetryLogic> Unpin for RetryPolicyFuture<L> {}

impl<L: RetryLogic> Future for RetryPolicyFuture<L> {
    type Output = FixedBackoffPolicy<L>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::task::ready!(self.delay.poll_unpin(cx));
        Poll::Ready(self.policy.clone())
    }
}
