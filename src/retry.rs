use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::error::Error;
use crate::request::CancelSignal;
use crate::response::Response;

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Predicate deciding whether one attempt's outcome warrants a retry.
pub type RetryTrigger = Arc<dyn Fn(Option<&Response>, Option<&Error>) -> bool + Send + Sync>;

/// Retry configuration: how many retries are allowed, how long to wait
/// between them, and what outcomes trigger one.
///
/// `max_attempts` counts retries, not total attempts: the default of 3
/// allows up to 4 attempts. With no custom triggers the policy retries
/// transport errors and 429 responses; any other status, 5xx included,
/// is returned to the caller as-is.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Arc<dyn Backoff>,
    triggers: Vec<RetryTrigger>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Arc::new(ExponentialBackoff::new(
                DEFAULT_BASE_INTERVAL,
                DEFAULT_MAX_INTERVAL,
                true,
            )),
            triggers: Vec::new(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a retry trigger. Once any trigger is registered the
    /// triggers fully replace the default decision: the outcome is
    /// retried iff at least one trigger says so.
    pub fn trigger<F>(mut self, trigger: F) -> Self
    where
        F: Fn(Option<&Response>, Option<&Error>) -> bool + Send + Sync + 'static,
    {
        self.triggers.push(Arc::new(trigger));
        self
    }

    pub(crate) fn max_attempts_configured(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn should_retry(
        &self,
        cancel: &CancelSignal,
        attempt_num: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if attempt_num >= self.max_attempts {
            return false;
        }

        if !self.triggers.is_empty() {
            return self
                .triggers
                .iter()
                .any(|trigger| trigger(response, error));
        }

        error.is_some()
            || response.is_some_and(|response| response.status() == StatusCode::TOO_MANY_REQUESTS)
    }

    pub(crate) fn wait(
        &self,
        attempt_num: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> Duration {
        self.backoff.wait(attempt_num, response, error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("triggers", &self.triggers.len())
            .finish_non_exhaustive()
    }
}
