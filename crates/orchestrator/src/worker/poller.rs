//! Idle polling with exponential backoff
//!
//! Workers are woken by the queue when work arrives, but retries become
//! eligible on a timer, so an idle worker also re-polls on an interval that
//! grows while the queue stays empty.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval right after a task was found
    #[serde(with = "crate::duration_millis")]
    pub min_interval: Duration,

    /// Upper bound for the idle poll interval
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no task was found
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Current idle interval of one worker
#[derive(Debug, Clone)]
pub(crate) struct IdleBackoff {
    config: PollerConfig,
    current: Duration,
}

impl IdleBackoff {
    pub(crate) fn new(config: PollerConfig) -> Self {
        Self {
            current: config.min_interval,
            config,
        }
    }

    /// Interval to sleep now; grows the next one
    pub(crate) fn next(&mut self) -> Duration {
        let interval = self.current;
        let grown = Duration::from_secs_f64(
            self.current.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current = grown.min(self.config.max_interval);
        interval
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.config.min_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = IdleBackoff::new(
            PollerConfig::new()
                .with_min_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(50))
                .with_backoff_multiplier(2.0),
        );

        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(40));
        assert_eq!(backoff.next(), Duration::from_millis(50));
        assert_eq!(backoff.next(), Duration::from_millis(50));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    #[test]
    fn test_multiplier_floor() {
        let config = PollerConfig::new().with_backoff_multiplier(0.5);
        assert_eq!(config.backoff_multiplier, 1.0);
    }
}
