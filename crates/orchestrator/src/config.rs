//! Orchestrator configuration
//!
//! Every section has defaults; `from_env` overlays `HACKGPT_*` variables:
//!
//! | Variable                       | Field                                 |
//! |--------------------------------|---------------------------------------|
//! | `HACKGPT_MIN_WORKERS`          | `pool.min_workers`                    |
//! | `HACKGPT_MAX_WORKERS`          | `pool.max_workers`                    |
//! | `HACKGPT_QUEUE_CAPACITY`       | `queue.capacity`                      |
//! | `HACKGPT_BACKPRESSURE`         | `queue.backpressure` (`reject`/`block`) |
//! | `HACKGPT_BLOCK_MAX_WAIT_MS`    | `Block { max_wait }`                  |
//! | `HACKGPT_CIRCUIT_OPEN_POLICY`  | `queue.circuit_open_policy` (`fail_fast`/`defer`) |
//! | `HACKGPT_HEARTBEAT_INTERVAL_MS`| `pool.heartbeat_interval`             |
//! | `HACKGPT_MISSED_HEARTBEATS`    | `pool.missed_heartbeats`              |
//! | `HACKGPT_SHUTDOWN_GRACE_MS`    | `pool.shutdown_grace`                 |
//! | `HACKGPT_BREAKER_THRESHOLD`    | `circuit_breaker.failure_threshold`   |
//! | `HACKGPT_BREAKER_COOLDOWN_MS`  | `circuit_breaker.cooldown`            |
//! | `HACKGPT_RETRY_BASE_MS`        | `retry.initial_interval`              |
//! | `HACKGPT_RETRY_MAX_MS`         | `retry.max_interval`                  |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{BackpressurePolicy, CircuitOpenPolicy, QueueConfig};
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::worker::PoolConfig;

const DEFAULT_BLOCK_MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Defaults overlaid with `HACKGPT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        if let Some(min) = env.parse("HACKGPT_MIN_WORKERS")? {
            config.pool.min_workers = min;
        }
        if let Some(max) = env.parse("HACKGPT_MAX_WORKERS")? {
            config.pool.max_workers = max;
        }
        if let Some(interval) = env.millis("HACKGPT_HEARTBEAT_INTERVAL_MS")? {
            config.pool.heartbeat_interval = interval;
        }
        if let Some(missed) = env.parse("HACKGPT_MISSED_HEARTBEATS")? {
            config.pool.missed_heartbeats = missed;
        }
        if let Some(grace) = env.millis("HACKGPT_SHUTDOWN_GRACE_MS")? {
            config.pool.shutdown_grace = grace;
        }

        if let Some(capacity) = env.parse("HACKGPT_QUEUE_CAPACITY")? {
            config.queue.capacity = capacity;
        }
        let max_wait = env
            .millis("HACKGPT_BLOCK_MAX_WAIT_MS")?
            .unwrap_or(DEFAULT_BLOCK_MAX_WAIT);
        if let Some(policy) = env.get("HACKGPT_BACKPRESSURE") {
            config.queue.backpressure = match policy.trim().to_lowercase().as_str() {
                "reject" => BackpressurePolicy::Reject,
                "block" => BackpressurePolicy::Block { max_wait },
                _ => return Err(env.invalid("HACKGPT_BACKPRESSURE", &policy, "expected reject or block")),
            };
        }
        if let Some(policy) = env.get("HACKGPT_CIRCUIT_OPEN_POLICY") {
            config.queue.circuit_open_policy = match policy.trim().to_lowercase().as_str() {
                "fail_fast" | "fail-fast" => CircuitOpenPolicy::FailFast,
                "defer" => CircuitOpenPolicy::Defer,
                _ => {
                    return Err(env.invalid(
                        "HACKGPT_CIRCUIT_OPEN_POLICY",
                        &policy,
                        "expected fail_fast or defer",
                    ))
                }
            };
        }

        if let Some(threshold) = env.parse("HACKGPT_BREAKER_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(cooldown) = env.millis("HACKGPT_BREAKER_COOLDOWN_MS")? {
            config.circuit_breaker.cooldown = cooldown;
        }

        if let Some(base) = env.millis("HACKGPT_RETRY_BASE_MS")? {
            config.retry.initial_interval = base;
        }
        if let Some(max) = env.millis("HACKGPT_RETRY_MAX_MS")? {
            config.retry.max_interval = max;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be greater than 0");
        }
        if self.pool.min_workers == 0 {
            return invalid("pool.min_workers must be at least 1");
        }
        if self.pool.max_workers < self.pool.min_workers {
            return Err(ConfigError::Invalid(format!(
                "pool.max_workers ({}) is below pool.min_workers ({})",
                self.pool.max_workers, self.pool.min_workers
            )));
        }
        if self.pool.heartbeat_interval.is_zero() {
            return invalid("pool.heartbeat_interval must be non-zero");
        }
        if self.pool.missed_heartbeats == 0 {
            return invalid("pool.missed_heartbeats must be at least 1");
        }
        if self.pool.poller.min_interval.is_zero()
            || self.pool.poller.max_interval < self.pool.poller.min_interval
        {
            return invalid("pool.poller intervals must be non-zero and ordered");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.retry.max_interval < self.retry.initial_interval {
            return invalid("retry.max_interval is below retry.initial_interval");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within 0.0..=1.0");
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|e: T::Err| self.invalid(var, &value, &e.to_string()))
            })
            .transpose()
    }

    fn millis(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }

    fn invalid(&self, var: &str, value: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
