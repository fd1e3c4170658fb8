//! Circuit breaker state machine

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Cooldown elapsed - a single trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐    cooldown     ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲      trial fails          │
///      │                               └───────────────────────────┤
///      │                 trial succeeds                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use hackgpt_orchestrator::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_cooldown(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before moving from open to half-open
    #[serde(with = "crate::duration_millis")]
    pub cooldown: Duration,

    /// Cooldown growth each time a half-open trial fails (1.0 = constant)
    pub cooldown_multiplier: f64,

    /// Upper bound for the grown cooldown
    #[serde(with = "crate::duration_millis")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 1.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown (time before trying again after opening)
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Grow the cooldown by `multiplier` after every failed trial, up to `max`
    pub fn with_cooldown_backoff(mut self, multiplier: f64, max: Duration) -> Self {
        self.cooldown_multiplier = multiplier.max(1.0);
        self.max_cooldown = max;
        self
    }
}

/// How an attempt was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal call
    Normal,

    /// The single half-open trial
    Trial,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub status: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    #[serde(with = "crate::duration_millis")]
    pub cooldown_duration: Duration,
    /// Times the breaker has opened
    pub trips: u64,
}

/// Failure tracker for one resource type
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    opened_instant: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_instant: None,
            cooldown,
            trial_in_flight: false,
            trips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current cooldown, including any growth from failed trials
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Move `Open -> HalfOpen` once the cooldown has elapsed
    ///
    /// Returns the new state if a transition happened.
    pub fn refresh(&mut self, now: Instant) -> Option<CircuitState> {
        if self.state == CircuitState::Open && self.cooldown_remaining(now).is_zero() {
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
            return Some(CircuitState::HalfOpen);
        }
        None
    }

    /// Time left until an open breaker allows a trial
    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        match (self.state, self.opened_instant) {
            (CircuitState::Open, Some(opened)) => {
                (opened + self.cooldown).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Whether an attempt would currently be admitted, without taking a slot
    pub fn admits(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_remaining(now).is_zero(),
            CircuitState::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Ask to let an attempt through
    ///
    /// On refusal returns how long until a trial may be possible
    /// (zero when a trial is already in flight).
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, Duration> {
        self.refresh(now);
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(self.cooldown_remaining(now)),
            CircuitState::HalfOpen if self.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    /// Record a successful call; returns the new state on transition
    pub fn record_success(&mut self, admission: Admission) -> Option<CircuitState> {
        match (admission, self.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                self.close();
                Some(CircuitState::Closed)
            }
            (Admission::Normal, CircuitState::Closed) => {
                self.consecutive_failures = 0;
                None
            }
            // Outcome of an attempt admitted before the breaker changed state
            _ => None,
        }
    }

    /// Record a failed call; returns the new state on transition
    pub fn record_failure(&mut self, admission: Admission, now: Instant) -> Option<CircuitState> {
        match (admission, self.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                let grown = self.cooldown.mul_f64(self.config.cooldown_multiplier);
                self.cooldown = grown.min(self.config.max_cooldown.max(self.config.cooldown));
                self.open(now);
                Some(CircuitState::Open)
            }
            (Admission::Normal, CircuitState::Closed) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Give back a trial slot whose attempt ended without an outcome
    pub fn release_trial(&mut self, admission: Admission) {
        if admission == Admission::Trial && self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Administrative reset to `Closed`
    pub fn reset(&mut self) {
        self.close();
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            status: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
            failure_threshold: self.config.failure_threshold,
            cooldown_duration: self.cooldown,
            trips: self.trips,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.opened_instant = Some(now);
        self.trial_in_flight = false;
        self.trips += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_instant = None;
        self.cooldown = self.config.cooldown;
        self.trial_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_cooldown(Duration::from_secs(10)),
        )
    }

    fn trip(breaker: &mut CircuitBreaker, now: Instant) {
        for _ in 0..3 {
            let admission = breaker.try_acquire(now).unwrap();
            breaker.record_failure(admission, now);
        }
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.cooldown_multiplier, 1.0);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_starts_closed() {
        let mut breaker = breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(Instant::now()), Ok(Admission::Normal));
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = breaker();
        let now = Instant::now();

        let a = breaker.try_acquire(now).unwrap();
        assert_eq!(breaker.record_failure(a, now), None);
        let a = breaker.try_acquire(now).unwrap();
        assert_eq!(breaker.record_failure(a, now), None);
        let a = breaker.try_acquire(now).unwrap();
        assert_eq!(breaker.record_failure(a, now), Some(CircuitState::Open));

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().opened_at.is_some());
        assert_eq!(breaker.try_acquire(now), Err(Duration::from_secs(10)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut breaker = breaker();
        let now = Instant::now();

        for _ in 0..2 {
            let a = breaker.try_acquire(now).unwrap();
            breaker.record_failure(a, now);
        }
        let a = breaker.try_acquire(now).unwrap();
        breaker.record_success(a);
        assert_eq!(breaker.consecutive_failures(), 0);

        let a = breaker.try_acquire(now).unwrap();
        breaker.record_failure(a, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        let later = now + Duration::from_secs(10);
        assert!(breaker.admits(later));
        assert_eq!(breaker.try_acquire(later), Ok(Admission::Trial));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one trial at a time
        assert_eq!(breaker.try_acquire(later), Err(Duration::ZERO));
        assert!(!breaker.admits(later));
    }

    #[test]
    fn test_trial_success_closes() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        let later = now + Duration::from_secs(11);
        let trial = breaker.try_acquire(later).unwrap();
        assert_eq!(breaker.record_success(trial), Some(CircuitState::Closed));
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.try_acquire(later), Ok(Admission::Normal));
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_timestamp() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        let later = now + Duration::from_secs(10);
        let trial = breaker.try_acquire(later).unwrap();
        assert_eq!(
            breaker.record_failure(trial, later),
            Some(CircuitState::Open)
        );
        assert_eq!(breaker.cooldown_remaining(later), Duration::from_secs(10));
        assert_eq!(breaker.snapshot().trips, 2);
    }

    #[test]
    fn test_cooldown_backoff_is_capped() {
        let mut breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_secs(10))
                .with_cooldown_backoff(2.0, Duration::from_secs(25)),
        );
        let mut now = Instant::now();
        let a = breaker.try_acquire(now).unwrap();
        breaker.record_failure(a, now);

        now += Duration::from_secs(10);
        let trial = breaker.try_acquire(now).unwrap();
        breaker.record_failure(trial, now);
        assert_eq!(breaker.cooldown(), Duration::from_secs(20));

        now += Duration::from_secs(20);
        let trial = breaker.try_acquire(now).unwrap();
        breaker.record_failure(trial, now);
        assert_eq!(breaker.cooldown(), Duration::from_secs(25));

        now += Duration::from_secs(25);
        let trial = breaker.try_acquire(now).unwrap();
        breaker.record_success(trial);
        assert_eq!(breaker.cooldown(), Duration::from_secs(10));
    }

    #[test]
    fn test_release_trial_frees_slot() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        let later = now + Duration::from_secs(10);
        let trial = breaker.try_acquire(later).unwrap();
        breaker.release_trial(trial);
        assert_eq!(breaker.try_acquire(later), Ok(Admission::Trial));
    }

    #[test]
    fn test_stale_outcomes_are_ignored() {
        let mut breaker = breaker();
        let now = Instant::now();
        let early = breaker.try_acquire(now).unwrap();
        trip(&mut breaker, now);

        // An attempt admitted before the trip finishes late
        assert_eq!(breaker.record_success(early), None);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.record_failure(early, now), None);
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[test]
    fn test_reset() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(now), Ok(Admission::Normal));
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
