//! Per-resource circuit breaker table

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use super::circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
use crate::metrics::{self, MetricsSink, NoopMetrics};

/// Attempt refused because the resource's breaker is not admitting calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker for '{resource_type}' is {state}, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub resource_type: String,
    pub state: CircuitState,
    /// Time until the breaker may admit a trial (zero if a trial is in flight)
    pub retry_in: Duration,
}

/// Admission held for the duration of one attempt
///
/// Report the outcome with [`CircuitBreakerRegistry::record_success`],
/// [`CircuitBreakerRegistry::record_failure`] or give it back unused with
/// [`CircuitBreakerRegistry::release`]. A permit dropped without an outcome,
/// e.g. by an aborted worker, gives its trial slot back.
#[derive(Debug)]
pub struct BreakerPermit {
    resource_type: String,
    admission: Admission,
    breakers: Weak<DashMap<String, CircuitBreaker>>,
    settled: bool,
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled || self.admission != Admission::Trial {
            return;
        }
        let Some(breakers) = self.breakers.upgrade() else {
            return;
        };
        if let Some(mut breaker) = breakers.get_mut(&self.resource_type) {
            breaker.release_trial(self.admission);
            tracing::debug!(resource_type = %self.resource_type, "Unreported trial released");
        };
    }
}

impl BreakerPermit {
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }
}

/// Circuit breakers keyed by resource type, created lazily in `Closed`
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask the breaker for `resource_type` to admit an attempt
    pub fn acquire(&self, resource_type: &str) -> Result<BreakerPermit, CircuitOpenError> {
        let now = Instant::now();
        let (outcome, transition, state) = {
            let mut breaker = self
                .breakers
                .entry(resource_type.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
            let before = breaker.state();
            let outcome = breaker.try_acquire(now);
            let after = breaker.state();
            (outcome, (before != after).then_some(after), after)
        };

        if let Some(to) = transition {
            self.on_transition(resource_type, to);
        }

        match outcome {
            Ok(admission) => Ok(BreakerPermit {
                resource_type: resource_type.to_string(),
                admission,
                breakers: Arc::downgrade(&self.breakers),
                settled: false,
            }),
            Err(retry_in) => Err(CircuitOpenError {
                resource_type: resource_type.to_string(),
                state,
                retry_in,
            }),
        }
    }

    /// Whether an attempt for `resource_type` would be refused right now
    ///
    /// Never creates a breaker and never takes a trial slot.
    pub fn is_blocking(&self, resource_type: &str) -> bool {
        self.breakers
            .get(resource_type)
            .is_some_and(|breaker| !breaker.admits(Instant::now()))
    }

    /// Time until `resource_type` may admit a trial
    pub fn retry_in(&self, resource_type: &str) -> Duration {
        self.breakers
            .get(resource_type)
            .map(|breaker| breaker.cooldown_remaining(Instant::now()))
            .unwrap_or_default()
    }

    pub fn record_success(&self, mut permit: BreakerPermit) {
        permit.settled = true;
        let transition = self
            .breakers
            .get_mut(&permit.resource_type)
            .and_then(|mut breaker| breaker.record_success(permit.admission));
        if let Some(to) = transition {
            self.on_transition(&permit.resource_type, to);
        }
    }

    pub fn record_failure(&self, mut permit: BreakerPermit) {
        permit.settled = true;
        let now = Instant::now();
        let transition = self
            .breakers
            .get_mut(&permit.resource_type)
            .and_then(|mut breaker| breaker.record_failure(permit.admission, now));
        if let Some(to) = transition {
            self.on_transition(&permit.resource_type, to);
        }
    }

    /// Return a permit whose attempt ended without a success or failure
    pub fn release(&self, mut permit: BreakerPermit) {
        permit.settled = true;
        if let Some(mut breaker) = self.breakers.get_mut(&permit.resource_type) {
            breaker.release_trial(permit.admission);
        }
    }

    /// Current state, `Closed` for resources never seen
    pub fn state(&self, resource_type: &str) -> CircuitState {
        self.snapshot(resource_type)
            .map(|s| s.status)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, resource_type: &str) -> Option<CircuitBreakerSnapshot> {
        let now = Instant::now();
        let (snapshot, transition) = {
            let mut breaker = self.breakers.get_mut(resource_type)?;
            let transition = breaker.refresh(now);
            (breaker.snapshot(), transition)
        };
        if let Some(to) = transition {
            self.on_transition(resource_type, to);
        }
        Some(snapshot)
    }

    /// Snapshot of every breaker created so far
    pub fn snapshots(&self) -> HashMap<String, CircuitBreakerSnapshot> {
        let keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.snapshot(&key).map(|s| (key, s)))
            .collect()
    }

    /// Force the breaker for `resource_type` back to `Closed`
    ///
    /// Returns `false` if no breaker exists for that resource.
    pub fn reset(&self, resource_type: &str) -> bool {
        let changed = match self.breakers.get_mut(resource_type) {
            Some(mut breaker) => {
                let was = breaker.state();
                breaker.reset();
                Some(was != CircuitState::Closed)
            }
            None => None,
        };

        match changed {
            Some(true) => {
                tracing::info!(resource_type, "Circuit breaker reset");
                self.on_transition(resource_type, CircuitState::Closed);
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    fn on_transition(&self, resource_type: &str, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(resource_type, state = %to, "Circuit breaker opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(resource_type, state = %to, "Circuit breaker half-open")
            }
            CircuitState::Closed => {
                tracing::info!(resource_type, state = %to, "Circuit breaker closed")
            }
        }
        let to = to.to_string();
        self.metrics.increment_counter(
            metrics::BREAKER_TRANSITIONS,
            &[("resource_type", resource_type), ("to", to.as_str())],
            1,
        );
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish()
    }
}
