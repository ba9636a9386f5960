//! Reconciler Metrics
//!
//! Counters, gauges and a duration histogram kept in atomics, rendered as
//! Prometheus text for the local scrape endpoint.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the cycle duration buckets, in milliseconds
pub const DURATION_BUCKETS_MS: [u64; 8] = [10, 50, 100, 250, 500, 1000, 2500, 5000];

pub trait MetricsSink: Send + Sync {
    /// One finished (or abandoned) cycle
    fn record_cycle(&self, scope: &str, duration: Duration, success: bool);

    /// One action outcome; `label` is `<action>_<resource>`
    fn record_action(&self, label: &str, outcome: &str);

    fn record_drift(&self, scope: &str, count: u64);

    fn set_active_domains(&self, scope: &str, count: u64);
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len()],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn observe(&self, ms: u64) {
        for (bound, bucket) in DURATION_BUCKETS_MS.iter().zip(&self.buckets) {
            if ms <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

/// Atomic metrics registry
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    duration: Histogram,
    cycles: AtomicU64,
    cycle_failures: AtomicU64,
    drift: DashMap<String, u64>,
    active_domains: DashMap<String, u64>,
    /// outcome -> count
    outcomes: DashMap<String, u64>,
    /// (`<action>_<resource>`, outcome) -> count
    actions: DashMap<(String, String), u64>,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn cycle_failures(&self) -> u64 {
        self.cycle_failures.load(Ordering::Relaxed)
    }

    pub fn drift(&self, scope: &str) -> u64 {
        self.drift.get(scope).map(|v| *v).unwrap_or(0)
    }

    pub fn active_domains(&self, scope: &str) -> u64 {
        self.active_domains.get(scope).map(|v| *v).unwrap_or(0)
    }

    pub fn actions(&self, label: &str, outcome: &str) -> u64 {
        self.actions
            .get(&(label.to_string(), outcome.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Export as Prometheus format
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP reconciliation_duration_ms Reconciliation cycle duration");
        let _ = writeln!(out, "# TYPE reconciliation_duration_ms histogram");
        for (bound, bucket) in DURATION_BUCKETS_MS.iter().zip(&self.duration.buckets) {
            let _ = writeln!(
                out,
                "reconciliation_duration_ms_bucket{{le=\"{}\"}} {}",
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let count = self.duration.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "reconciliation_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
        let _ = writeln!(
            out,
            "reconciliation_duration_ms_sum {}",
            self.duration.sum_ms.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "reconciliation_duration_ms_count {}", count);

        let _ = writeln!(out, "# HELP reconciliation_cycles_total Reconciliation cycles run");
        let _ = writeln!(out, "# TYPE reconciliation_cycles_total counter");
        let _ = writeln!(out, "reconciliation_cycles_total {}", self.cycles());

        let _ = writeln!(out, "# HELP reconciliation_cycle_failures_total Cycles abandoned, timed out or panicked");
        let _ = writeln!(out, "# TYPE reconciliation_cycle_failures_total counter");
        let _ = writeln!(out, "reconciliation_cycle_failures_total {}", self.cycle_failures());

        let _ = writeln!(out, "# HELP drift_detected_total Drifted resources found by discovery");
        let _ = writeln!(out, "# TYPE drift_detected_total counter");
        for (scope, value) in sorted(&self.drift) {
            let _ = writeln!(out, "drift_detected_total{{scope=\"{}\"}} {}", scope, value);
        }

        let _ = writeln!(out, "# HELP active_domains_count Domains with active isolation");
        let _ = writeln!(out, "# TYPE active_domains_count gauge");
        for (scope, value) in sorted(&self.active_domains) {
            let _ = writeln!(out, "active_domains_count{{scope=\"{}\"}} {}", scope, value);
        }

        let _ = writeln!(out, "# HELP reconciliation_actions_total Actions by outcome");
        let _ = writeln!(out, "# TYPE reconciliation_actions_total counter");
        for (outcome, value) in sorted(&self.outcomes) {
            let _ = writeln!(out, "reconciliation_actions_total{{outcome=\"{}\"}} {}", outcome, value);
        }
        for ((action, outcome), value) in sorted(&self.actions) {
            let _ = writeln!(
                out,
                "reconciliation_actions_total{{action=\"{}\",outcome=\"{}\"}} {}",
                action, outcome, value
            );
        }

        out
    }
}

fn sorted<K: Clone + Ord + std::hash::Hash + Eq>(map: &DashMap<K, u64>) -> Vec<(K, u64)> {
    let mut entries: Vec<(K, u64)> = map.iter().map(|e| (e.key().clone(), *e.value())).collect();
    entries.sort();
    entries
}

impl MetricsSink for ReconcilerMetrics {
    fn record_cycle(&self, _scope: &str, duration: Duration, success: bool) {
        self.duration.observe(duration.as_millis() as u64);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.cycle_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_action(&self, label: &str, outcome: &str) {
        *self.outcomes.entry(outcome.to_string()).or_insert(0) += 1;
        *self
            .actions
            .entry((label.to_string(), outcome.to_string()))
            .or_insert(0) += 1;
    }

    fn record_drift(&self, scope: &str, count: u64) {
        *self.drift.entry(scope.to_string()).or_insert(0) += count;
    }

    fn set_active_domains(&self, scope: &str, count: u64) {
        self.active_domains.insert(scope.to_string(), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let metrics = ReconcilerMetrics::new();
        metrics.record_cycle("blue", Duration::from_millis(40), true);
        metrics.record_cycle("blue", Duration::from_millis(7000), false);

        let text = metrics.export_prometheus();
        assert!(text.contains("reconciliation_duration_ms_bucket{le=\"10\"} 0"));
        assert!(text.contains("reconciliation_duration_ms_bucket{le=\"50\"} 1"));
        assert!(text.contains("reconciliation_duration_ms_bucket{le=\"5000\"} 1"));
        assert!(text.contains("reconciliation_duration_ms_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("reconciliation_duration_ms_sum 7040"));
        assert!(text.contains("reconciliation_cycles_total 2"));
        assert!(text.contains("reconciliation_cycle_failures_total 1"));
    }

    #[test]
    fn test_action_counters() {
        let metrics = ReconcilerMetrics::new();
        metrics.record_action("create_gateway", "applied");
        metrics.record_action("create_route", "applied");
        metrics.record_action("create_route", "skipped");
        metrics.record_drift("blue", 3);
        metrics.record_drift("blue", 1);
        metrics.set_active_domains("blue", 2);

        assert_eq!(metrics.actions("create_route", "applied"), 1);
        assert_eq!(metrics.drift("blue"), 4);
        assert_eq!(metrics.active_domains("blue"), 2);

        let text = metrics.export_prometheus();
        assert!(text.contains("reconciliation_actions_total{outcome=\"applied\"} 2"));
        assert!(text.contains(
            "reconciliation_actions_total{action=\"create_route\",outcome=\"skipped\"} 1"
        ));
        assert!(text.contains("drift_detected_total{scope=\"blue\"} 4"));
        assert!(text.contains("active_domains_count{scope=\"blue\"} 2"));
    }
}
