//! Retry backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff applied between attempts of a task
///
/// The delay after the `n`-th failed attempt is
/// `initial_interval * backoff_coefficient^(n-1)`, capped at `max_interval`.
/// Jitter only ever lengthens a delay, so the nominal schedule is a lower
/// bound on how long retries take.
///
/// # Example
///
/// ```
/// use hackgpt_orchestrator::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert_eq!(policy.backoff(1), Duration::from_secs(1));
/// assert_eq!(policy.backoff(2), Duration::from_secs(2));
/// assert_eq!(policy.backoff(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    #[serde(with = "crate::duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Extra random delay as a fraction of the nominal delay (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 1s initial, 60s cap, 2x, no jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    /// Retry immediately
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Same delay between every attempt
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Nominal delay (no jitter) after `attempt_count` failed attempts
    pub fn nominal_backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(63) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay to wait before the next attempt, jitter included
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let nominal = self.nominal_backoff(attempt_count);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        nominal + nominal.mul_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(60));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::exponential();

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_uses_initial_interval() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(5), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_never_shortens() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        for attempt in 1..6 {
            let nominal = policy.nominal_backoff(attempt);
            let actual = policy.backoff(attempt);
            assert!(actual >= nominal);
            assert!(actual <= nominal.mul_f64(1.5) + Duration::from_nanos(1));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_jitter(0.2);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
