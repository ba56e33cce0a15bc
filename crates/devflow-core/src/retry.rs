// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Exponential-backoff retry policy for `on_failure = retry` steps (§4.4).
//!
//! The executor never retries anything itself (§7 recovery policy); this
//! module is used exclusively by [`crate::runner::StepRunner`].

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Computes the delay before retry attempt `attempt` (1-indexed: the delay
/// before the *first* retry, i.e. the second attempt overall).
///
/// Doubles every attempt starting at 1s, capped at 30s (§4.4, §9 Open
/// Questions).
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = INITIAL_DELAY.as_millis() as u64;
    let doubled = millis.saturating_mul(1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX));
    Duration::from_millis(doubled).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), Duration::from_secs(30)); // would be 32, capped
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn monotonic() {
        let mut prev = Duration::from_secs(0);
        for attempt in 1..8 {
            let d = backoff_delay(attempt);
            assert!(d >= prev);
            prev = d;
        }
    }
}
