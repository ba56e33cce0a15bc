// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bucket rate limiter (§4.5), used to cap the rate at which the
//! Parallel Executor releases steps into dispatch (§5: independent of the
//! `max_concurrent` bound).

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct State {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with capacity equal to the refill rate (a one-second
/// burst, §4.5). Safe for concurrent acquirers.
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            rate_per_second,
            capacity: rate_per_second,
            state: Mutex::new(State {
                tokens: rate_per_second,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Blocks until a token is available or `deadline` expires (§4.5:
    /// `acquire(deadline)`). Returns `false` on deadline expiry.
    pub async fn acquire(&self, deadline: Instant) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate_per_second)
            };

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(wait.min(deadline - now)).await;
            if Instant::now() >= deadline {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(5.0);
        let deadline = Instant::now() + Duration::from_millis(50);
        for _ in 0..5 {
            assert!(limiter.acquire(deadline).await);
        }
    }

    #[tokio::test]
    async fn blocks_beyond_capacity_until_deadline() {
        let limiter = RateLimiter::new(2.0);
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(limiter.acquire(deadline).await);
        assert!(limiter.acquire(deadline).await);
        // Bucket exhausted; third acquire must wait past the short deadline.
        assert!(!limiter.acquire(deadline).await);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(10.0);
        let deadline = Instant::now() + Duration::from_millis(10);
        for _ in 0..10 {
            assert!(limiter.acquire(deadline).await);
        }
        let later_deadline = Instant::now() + Duration::from_millis(500);
        assert!(limiter.acquire(later_deadline).await);
    }
}
