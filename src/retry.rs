//! Retry policies for election backoff and lock polling.

use crate::config::RetryConfig;
use std::time::Duration;

/// Bounded retry schedule: `base * multiplier^attempt`, capped at `max_delay`.
///
/// A multiplier of `1.0` gives a fixed delay. With `jitter` enabled each delay
/// is drawn uniformly from `[delay / 2, delay]`, which spreads out participants
/// that lost the same race.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: true,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        use rand::RngExt;
        let scale: f64 = rand::rng().random_range(0.5..=1.0);
        nominal.mul_f64(scale)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = RetryPolicy::exponential(
            6,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        let delays: Vec<u64> = (0..6)
            .map(|a| policy.nominal_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        for attempt in 0..10 {
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(200), Duration::from_secs(5));
        for _ in 0..200 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(200), "{d:?}");
            assert!(d <= Duration::from_millis(400), "{d:?}");
        }
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn sub_one_multiplier_is_treated_as_fixed() {
        let mut policy = RetryPolicy::fixed(5, Duration::from_millis(50));
        policy.multiplier = 0.5;
        policy.max_delay = Duration::from_secs(1);
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(50));
    }
}
