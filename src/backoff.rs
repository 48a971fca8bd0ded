use std::time::Duration;

use rand::Rng;

use crate::error::Error;
use crate::response::Response;

/// Strategy that decides how long to wait before retrying a request.
///
/// `wait` is called after a failed attempt with the zero-based attempt
/// number and the outcome of that attempt. Attempt `0` is the first
/// failure, so every implementation must handle it.
pub trait Backoff: Send + Sync {
    fn wait(
        &self,
        attempt_num: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> Duration;
}

/// Fixed-interval backoff. With jitter enabled the wait is uniformly
/// distributed in `[interval/2, interval/2 + interval)`.
#[derive(Clone, Debug)]
pub struct ConstantBackoff {
    interval: Duration,
    jitter: bool,
}

impl ConstantBackoff {
    pub const fn new(interval: Duration, jitter: bool) -> Self {
        Self { interval, jitter }
    }
}

impl Backoff for ConstantBackoff {
    fn wait(&self, _attempt_num: usize, _response: Option<&Response>, _error: Option<&Error>) -> Duration {
        if !self.jitter {
            return self.interval;
        }

        let interval_ns = duration_nanos(self.interval);
        if interval_ns == 0 {
            return self.interval;
        }
        let mut rng = rand::rng();
        Duration::from_nanos((interval_ns / 2).saturating_add(rng.random_range(0..interval_ns)))
    }
}

/// Exponential backoff capped at `max_interval`:
/// `min(max_interval, base_interval * 2^attempt_num)`. With jitter the
/// wait is uniform in `[value/2, value)` (equal jitter), still never
/// above `max_interval`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_interval: Duration,
    max_interval: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub const fn new(base_interval: Duration, max_interval: Duration, jitter: bool) -> Self {
        Self {
            base_interval,
            max_interval,
            jitter,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn wait(&self, attempt_num: usize, _response: Option<&Response>, _error: Option<&Error>) -> Duration {
        let capped_exponent = attempt_num.min(63) as u32;
        let base_ns = duration_nanos(self.base_interval);
        let max_ns = duration_nanos(self.max_interval);
        let value_ns = base_ns
            .checked_shl(capped_exponent)
            .unwrap_or(u64::MAX)
            .min(max_ns);
        if !self.jitter {
            return Duration::from_nanos(value_ns);
        }

        let half_ns = value_ns / 2;
        if half_ns == 0 {
            return Duration::from_nanos(value_ns);
        }
        let mut rng = rand::rng();
        let jittered_ns = (half_ns + rng.random_range(0..half_ns)).min(max_ns);
        Duration::from_nanos(jittered_ns)
    }
}

/// Deterministic fibonacci backoff: the `attempt_num`-th value of the
/// sequence 1, 1, 2, 3, 5, 8, … multiplied by a unit interval, clamped to
/// `max_value` units when `max_value > 0` (0 means unbounded).
#[derive(Clone, Debug)]
pub struct FibonacciBackoff {
    max_value: u64,
    interval: Duration,
}

impl FibonacciBackoff {
    pub const fn new(max_value: u64, interval: Duration) -> Self {
        Self {
            max_value,
            interval,
        }
    }
}

impl Backoff for FibonacciBackoff {
    fn wait(&self, attempt_num: usize, _response: Option<&Response>, _error: Option<&Error>) -> Duration {
        let (mut current, mut next) = (0_u64, 1_u64);
        for _ in 0..=attempt_num {
            if self.max_value > 0 && next >= self.max_value {
                current = self.max_value;
                break;
            }
            let sum = current.saturating_add(next);
            current = next;
            next = sum;
        }
        self.interval.saturating_mul(current.min(u32::MAX as u64) as u32)
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}
