use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_core::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::hooks::{AfterResponseHook, BeforeRequestHook};
use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// Token-bucket configuration for [`RateGate`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    requests_per_second: f64,
    burst: usize,
}

impl RateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            requests_per_second: 50.0,
            burst: 50,
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = burst;
        self
    }

    fn normalize(self) -> Self {
        Self {
            requests_per_second: if self.requests_per_second.is_finite()
                && self.requests_per_second > 0.0
            {
                self.requests_per_second
            } else {
                1.0
            },
            burst: self.burst.max(1),
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let policy = policy.normalize();
        Self {
            policy,
            tokens: policy.burst as f64,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.policy.requests_per_second;
        self.tokens = (self.tokens + replenished).min(self.policy.burst as f64);
    }

    fn wait_duration(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let rate = self.policy.requests_per_second;
        if rate <= f64::EPSILON {
            return Duration::from_secs(60);
        }
        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / rate;
        if delay_secs <= f64::EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    fn can_consume_now(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn consume_ready_token(&mut self) {
        debug_assert!(self.tokens >= 1.0);
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

/// Token-bucket admission gate. Entering waits until a token is
/// available; a token is consumed only when admission is actually
/// granted, so a request cancelled mid-wait leaves the bucket
/// untouched. Leaving is a no-op.
#[derive(Debug)]
pub struct RateGate {
    bucket: Mutex<TokenBucket>,
}

impl RateGate {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(policy, Instant::now())),
        }
    }

    async fn admit(&self, request: &Request) -> Result<(), Error> {
        let cancel = request.cancel_signal().clone();
        loop {
            let wait = {
                let now = Instant::now();
                let mut bucket = lock_unpoisoned(&self.bucket);
                if bucket.can_consume_now(now) {
                    bucket.consume_ready_token();
                    return Ok(());
                }
                bucket.wait_duration(now)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(cancel.cancellation_error()),
            }
        }
    }
}

impl BeforeRequestHook for RateGate {
    fn enter<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.admit(request))
    }
}

impl AfterResponseHook for RateGate {
    fn exit(&self, _response: Option<&Response>, _error: Option<&Error>) {}
}

/// Bounds the number of requests in flight. Entering acquires a permit
/// (waiting cancellably when none is free); leaving returns it. Permits
/// are held across the whole call, retries included.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    async fn admit(&self, request: &Request) -> Result<(), Error> {
        if let Ok(permit) = self.semaphore.try_acquire() {
            permit.forget();
            return Ok(());
        }

        let cancel = request.cancel_signal().clone();
        tokio::select! {
            acquired = self.semaphore.acquire() => {
                match acquired {
                    Ok(permit) => {
                        permit.forget();
                        Ok(())
                    }
                    // The semaphore is never closed while the gate is alive.
                    Err(_) => Err(Error::Cancelled),
                }
            }
            _ = cancel.cancelled() => Err(cancel.cancellation_error()),
        }
    }
}

impl BeforeRequestHook for ConcurrencyGate {
    fn enter<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.admit(request))
    }
}

impl AfterResponseHook for ConcurrencyGate {
    fn exit(&self, _response: Option<&Response>, _error: Option<&Error>) {
        self.semaphore.add_permits(1);
    }
}
