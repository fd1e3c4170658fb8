//! Metrics emission
//!
//! The engine reports counters, gauges and histograms through a
//! [`MetricsSink`]. Three sinks ship with the crate:
//!
//! - [`NoopMetrics`] - drops everything (default)
//! - [`TracingMetrics`] - emits each sample as a `tracing` event on the
//!   `hackgpt::metrics` target, picked up by whatever subscriber is installed
//! - [`InMemoryMetrics`] - aggregates samples in memory, for tests and CLIs

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

pub const TASKS_SUBMITTED: &str = "tasks_submitted_total";
pub const TASKS_SUCCEEDED: &str = "tasks_succeeded_total";
pub const TASKS_FAILED: &str = "tasks_failed_total";
pub const TASKS_RETRIED: &str = "tasks_retried_total";
pub const TASKS_CANCELLED: &str = "tasks_cancelled_total";
pub const TASK_LATENCY: &str = "task_latency_seconds";
pub const TASK_QUEUE_WAIT: &str = "task_queue_wait_seconds";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const ACTIVE_WORKERS: &str = "active_workers";
pub const IDLE_WORKERS: &str = "idle_workers";
pub const BREAKER_TRANSITIONS: &str = "circuit_breaker_transitions_total";
pub const WORKERS_LOST: &str = "workers_lost_total";
pub const STORE_ERRORS: &str = "store_errors_total";

/// Label set attached to a sample
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Destination for engine metrics
pub trait MetricsSink: Send + Sync + 'static {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64);

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Sink that discards all samples
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _: &'static str, _: Labels<'_>, _: u64) {}

    fn set_gauge(&self, _: &'static str, _: Labels<'_>, _: f64) {}

    fn record_histogram(&self, _: &'static str, _: Labels<'_>, _: f64) {}
}

/// Sink that logs every sample at `TRACE` on the `hackgpt::metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        tracing::trace!(
            target: "hackgpt::metrics",
            metric = name,
            kind = "counter",
            labels = %format_labels(labels),
            value
        );
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        tracing::trace!(
            target: "hackgpt::metrics",
            metric = name,
            kind = "gauge",
            labels = %format_labels(labels),
            value
        );
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        tracing::trace!(
            target: "hackgpt::metrics",
            metric = name,
            kind = "histogram",
            labels = %format_labels(labels),
            value
        );
    }
}

/// Series key: metric name plus sorted labels
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: &'static str,
    pub labels: BTreeMap<&'static str, String>,
}

impl SeriesKey {
    fn new(name: &'static str, labels: Labels<'_>) -> Self {
        Self {
            name,
            labels: labels
                .iter()
                .map(|(k, v)| (*k, (*v).to_string()))
                .collect(),
        }
    }

    fn matches(&self, name: &str, labels: Labels<'_>) -> bool {
        self.name == name
            && labels
                .iter()
                .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

#[derive(Debug, Default)]
struct Samples {
    counters: HashMap<SeriesKey, u64>,
    gauges: HashMap<SeriesKey, f64>,
    histograms: HashMap<SeriesKey, Vec<f64>>,
}

/// Sink that keeps every sample in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Samples>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every counter series named `name` whose labels include `labels`
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.samples
            .lock()
            .counters
            .iter()
            .filter(|(key, _)| key.matches(name, labels))
            .map(|(_, value)| *value)
            .sum()
    }

    /// Last value of the gauge series matching `name` and exactly `labels`
    pub fn gauge(&self, name: &'static str, labels: Labels<'_>) -> Option<f64> {
        self.samples
            .lock()
            .gauges
            .get(&SeriesKey::new(name, labels))
            .copied()
    }

    /// All samples recorded for histograms matching `name` and `labels`
    pub fn histogram(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        self.samples
            .lock()
            .histograms
            .iter()
            .filter(|(key, _)| key.matches(name, labels))
            .flat_map(|(_, values)| values.iter().copied())
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        *self
            .samples
            .lock()
            .counters
            .entry(SeriesKey::new(name, labels))
            .or_default() += value;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.samples
            .lock()
            .gauges
            .insert(SeriesKey::new(name, labels), value);
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.samples
            .lock()
            .histograms
            .entry(SeriesKey::new(name, labels))
            .or_default()
            .push(value);
    }
}

fn format_labels(labels: Labels<'_>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters_aggregate_by_label_subset() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_counter(TASKS_SUBMITTED, &[("resource_type", "nmap")], 1);
        metrics.increment_counter(TASKS_SUBMITTED, &[("resource_type", "nmap")], 2);
        metrics.increment_counter(TASKS_SUBMITTED, &[("resource_type", "openai")], 1);

        assert_eq!(metrics.counter(TASKS_SUBMITTED, &[]), 4);
        assert_eq!(
            metrics.counter(TASKS_SUBMITTED, &[("resource_type", "nmap")]),
            3
        );
        assert_eq!(metrics.counter(TASKS_FAILED, &[]), 0);
    }

    #[test]
    fn test_in_memory_gauge_keeps_last_value() {
        let metrics = InMemoryMetrics::new();
        metrics.set_gauge(QUEUE_DEPTH, &[], 3.0);
        metrics.set_gauge(QUEUE_DEPTH, &[], 1.0);

        assert_eq!(metrics.gauge(QUEUE_DEPTH, &[]), Some(1.0));
        assert_eq!(metrics.gauge(ACTIVE_WORKERS, &[]), None);
    }

    #[test]
    fn test_in_memory_histogram() {
        let metrics = InMemoryMetrics::new();
        metrics.record_histogram(TASK_LATENCY, &[("resource_type", "nmap")], 0.5);
        metrics.record_histogram(TASK_LATENCY, &[("resource_type", "nmap")], 1.5);

        assert_eq!(metrics.histogram(TASK_LATENCY, &[]), vec![0.5, 1.5]);
    }

    #[test]
    fn test_noop_and_tracing_sinks_accept_samples() {
        let sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(NoopMetrics), Box::new(TracingMetrics)];
        for sink in sinks {
            sink.increment_counter(TASKS_SUBMITTED, &[("resource_type", "nmap")], 1);
            sink.set_gauge(QUEUE_DEPTH, &[], 1.0);
            sink.record_histogram(TASK_LATENCY, &[], 0.1);
        }
    }
}
