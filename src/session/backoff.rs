//! Truncated binary exponential backoff between reconnection attempts.
//!
//! The parameters `(base, min_s, max_s)` come from the `/env` descriptor and
//! are re-applied on every bootstrap. The first attempt is immediate; attempt
//! `k > 1` waits `base^(k-1)` seconds plus a random jitter bounded by
//! `max(1s, delay/2)`, clamped into `[min_s, max_s]`. A run of PUBACKs in a
//! stable session resets the attempt counter, and a cloud-dictated block
//! always wins over the computed delay.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Number of PUBACKs in one session after which the connection counts as
/// stable and the backoff resets.
pub const PUBACKS_CONN_STABLE: u32 = 3;

/// Delay used while the cloud has disabled the link at runtime.
pub const DISABLED_RUNTIME_DELAY: Duration = Duration::from_secs(60);

/// Backoff parameters from the `/env` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffParams {
    /// Exponent base, valid range 1..=10.
    pub base: u32,
    #[serde(rename = "minSeconds")]
    pub min_s: u64,
    #[serde(rename = "maxSeconds")]
    pub max_s: u64,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            base: 2,
            min_s: 0,
            max_s: 1024,
        }
    }
}

impl BackoffParams {
    pub fn is_valid(&self) -> bool {
        (1..=10).contains(&self.base) && self.max_s >= self.min_s
    }
}

#[derive(Debug)]
pub struct Backoff {
    params: BackoffParams,
    attempt: u32,
}

impl Backoff {
    pub fn new(params: BackoffParams) -> Self {
        Self { params, attempt: 0 }
    }

    /// Swaps in fresh parameters without touching the attempt counter, so a
    /// rebuilt `/env` descriptor does not forgive past failures.
    pub fn set_params(&mut self, params: BackoffParams) {
        self.params = params;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advances the attempt counter and computes the next delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        if self.attempt == 1 {
            return Duration::ZERO;
        }

        let exp = self.attempt - 1;
        let base_ms = (self.params.base as u64)
            .saturating_pow(exp.min(63))
            .saturating_mul(1000);
        let jitter_bound = base_ms.div_euclid(2).max(1000);
        let jitter = rand::thread_rng().gen_range(0..jitter_bound);
        let delay_ms = base_ms.saturating_add(jitter);

        let min_ms = self.params.min_s.saturating_mul(1000);
        let max_ms = self.params.max_s.saturating_mul(1000);
        Duration::from_millis(delay_ms.clamp(min_ms, max_ms.max(min_ms)))
    }

    /// Connection proved stable; the next attempt is immediate again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(base: u32, min_s: u64, max_s: u64) -> BackoffParams {
        BackoffParams { base, min_s, max_s }
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = Backoff::new(params(2, 0, 60));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn delays_grow_monotonically_up_to_max() {
        let mut backoff = Backoff::new(params(2, 0, 3600));
        let mut previous = backoff.next_delay();
        for _ in 0..8 {
            let next = backoff.next_delay();
            // jitter is bounded by max(1s, delay/2), so the deterministic part
            // dominates and consecutive delays never shrink below the previous
            // deterministic floor
            let exp = backoff.attempt() - 1;
            let floor = Duration::from_secs(2u64.pow(exp));
            assert!(next >= floor.min(Duration::from_secs(3600)));
            assert!(next >= previous.min(floor));
            previous = next;
        }
    }

    #[test]
    fn delay_clamped_into_configured_range() {
        let mut backoff = Backoff::new(params(2, 5, 10));
        backoff.next_delay();
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn reset_makes_next_attempt_immediate() {
        let mut backoff = Backoff::new(params(2, 0, 60));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut backoff = Backoff::new(params(2, 0, 3600));
        backoff.next_delay();
        // attempt 2: deterministic part 2s, jitter < max(1s, 1s)
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(2));
        assert!(delay < Duration::from_secs(4));
    }

    #[test]
    fn param_validation() {
        assert!(params(1, 0, 60).is_valid());
        assert!(params(10, 1, 60).is_valid());
        assert!(!params(0, 0, 60).is_valid());
        assert!(!params(11, 0, 60).is_valid());
        assert!(!params(2, 61, 60).is_valid());
    }
}
