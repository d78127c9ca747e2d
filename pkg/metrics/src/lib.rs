use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Object events applied by the reconciler.
pub const EVENTS_PROCESSED: &str = "flowproxy_events_processed_total";
/// Executor calls issued (install/remove of flows and groups).
pub const EXECUTOR_CALLS: &str = "flowproxy_executor_calls_total";
/// Executor calls that timed out or were rejected.
pub const EXECUTOR_FAILURES: &str = "flowproxy_executor_failures_total";
/// Retries scheduled after a transient executor failure.
pub const EXECUTOR_RETRIES: &str = "flowproxy_executor_retries_total";
/// Services whose retries were exhausted and are not converged.
pub const DEGRADED_SERVICES: &str = "flowproxy_degraded_services";
/// Flows currently installed by the reconciler.
pub const INSTALLED_FLOWS: &str = "flowproxy_installed_flows";
/// Groups currently installed by the reconciler.
pub const INSTALLED_GROUPS: &str = "flowproxy_installed_groups";
/// Live session affinity bindings.
pub const AFFINITY_BINDINGS: &str = "flowproxy_affinity_bindings";
/// Affinity bindings removed by expiry or invalidation.
pub const AFFINITY_EVICTIONS: &str = "flowproxy_affinity_evictions_total";
/// Endpoint snapshots dropped because their Service never arrived.
pub const ORPHAN_ENDPOINTS_DROPPED: &str = "flowproxy_orphan_endpoints_dropped_total";

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
}

/// Monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
pub struct Gauge {
    value: AtomicI64,
    help: String,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry pre-populated with every metric the flow proxy reports.
    pub fn for_proxy() -> Self {
        let registry = Self::new();
        registry.register_counter(EVENTS_PROCESSED, "Object events applied by the reconciler");
        registry.register_counter(EXECUTOR_CALLS, "Flow/group mutations issued to the executor");
        registry.register_counter(EXECUTOR_FAILURES, "Executor mutations that timed out or were rejected");
        registry.register_counter(EXECUTOR_RETRIES, "Executor mutations retried after a transient failure");
        registry.register_gauge(DEGRADED_SERVICES, "Services not converged after exhausting retries");
        registry.register_gauge(INSTALLED_FLOWS, "Flows installed by the reconciler");
        registry.register_gauge(INSTALLED_GROUPS, "Groups installed by the reconciler");
        registry.register_gauge(AFFINITY_BINDINGS, "Live session affinity bindings");
        registry.register_counter(AFFINITY_EVICTIONS, "Affinity bindings expired or invalidated");
        registry.register_counter(
            ORPHAN_ENDPOINTS_DROPPED,
            "Endpoint snapshots discarded because their Service never arrived",
        );
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        if let Ok(mut counters) = self.counters.write() {
            counters.entry(name.to_string()).or_insert_with(|| Counter {
                value: AtomicU64::new(0),
                help: help.to_string(),
            });
        }
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        if let Ok(mut gauges) = self.gauges.write() {
            gauges.entry(name.to_string()).or_insert_with(|| Gauge {
                value: AtomicI64::new(0),
                help: help.to_string(),
            });
        }
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        if let Ok(counters) = self.counters.read()
            && let Some(c) = counters.get(name)
        {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Current counter value (0 if unregistered).
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .ok()
            .and_then(|c| c.get(name).map(|c| c.value.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        if let Ok(gauges) = self.gauges.read()
            && let Some(g) = gauges.get(name)
        {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    /// Add a signed delta to a gauge.
    pub fn gauge_add(&self, name: &str, delta: i64) {
        if let Ok(gauges) = self.gauges.read()
            && let Some(g) = gauges.get(name)
        {
            g.value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Current gauge value (0 if unregistered).
    pub fn gauge_get(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .ok()
            .and_then(|g| g.get(name).map(|g| g.value.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        if let Ok(counters) = self.counters.read() {
            for (name, counter) in counters.iter() {
                output.push_str(&format!("# HELP {} {}\n", name, counter.help));
                output.push_str(&format!("# TYPE {} counter\n", name));
                output.push_str(&format!(
                    "{} {}\n",
                    name,
                    counter.value.load(Ordering::Relaxed)
                ));
            }
        }

        if let Ok(gauges) = self.gauges.read() {
            for (name, gauge) in gauges.iter() {
                output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
                output.push_str(&format!("# TYPE {} gauge\n", name));
                output.push_str(&format!(
                    "{} {}\n",
                    name,
                    gauge.value.load(Ordering::Relaxed)
                ));
            }
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
