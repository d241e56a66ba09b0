use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub const ADMISSION_ALLOWED: &str = "sharedquota_admission_allowed_total";
pub const ADMISSION_DENIED: &str = "sharedquota_admission_denied_total";
pub const ADMISSION_ERRORS: &str = "sharedquota_admission_errors_total";
pub const RECONCILE_TOTAL: &str = "sharedquota_reconcile_total";
pub const RECONCILE_ERRORS: &str = "sharedquota_reconcile_errors_total";
pub const STATUS_WRITES: &str = "sharedquota_status_writes_total";
pub const QUEUE_DEPTH: &str = "sharedquota_reconcile_queue_depth";

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

    /// Registry with every admission/reconcile metric pre-registered.
    pub fn with_quota_metrics() -> Self {
        let registry = Self::new();
        registry.register_counter(ADMISSION_ALLOWED, "Admission requests allowed");
        registry.register_counter(ADMISSION_DENIED, "Admission requests denied by quota");
        registry.register_counter(
            ADMISSION_ERRORS,
            "Admission requests rejected with an internal error",
        );
        registry.register_counter(RECONCILE_TOTAL, "Shared quota reconcile passes");
        registry.register_counter(RECONCILE_ERRORS, "Shared quota reconcile failures");
        registry.register_counter(STATUS_WRITES, "Shared quota status writes");
        registry.register_gauge(QUEUE_DEPTH, "Shared quota keys waiting to reconcile");
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write();
        counters.entry(name.to_string()).or_insert_with(|| Counter {
            value: AtomicU64::new(0),
            help: help.to_string(),
        });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write();
        gauges.entry(name.to_string()).or_insert_with(|| Gauge {
            value: AtomicI64::new(0),
            help: help.to_string(),
        });
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        if let Some(c) = self.counters.read().get(name) {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    pub fn counter_get(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        if let Some(g) = self.gauges.read().get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    pub fn gauge_get(&self, name: &str) -> Option<i64> {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, counter) in self.counters.read().iter() {
            let _ = writeln!(output, "# HELP {} {}", name, counter.help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, counter.value.load(Ordering::Relaxed));
        }

        for (name, gauge) in self.gauges.read().iter() {
            let _ = writeln!(output, "# HELP {} {}", name, gauge.help);
            let _ = writeln!(output, "# TYPE {} gauge", name);
            let _ = writeln!(output, "{} {}", name, gauge.value.load(Ordering::Relaxed));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_names_are_ignored() {
        let registry = MetricsRegistry::new();
        registry.counter_inc("nope");
        assert_eq!(registry.counter_get("nope"), None);
    }

    #[test]
    fn render_exposition_format() {
        let registry = MetricsRegistry::with_quota_metrics();
        registry.counter_inc(ADMISSION_DENIED);
        registry.counter_add(ADMISSION_DENIED, 2);
        registry.gauge_set(QUEUE_DEPTH, 5);

        let text = registry.render();
        assert!(text.contains("# TYPE sharedquota_admission_denied_total counter"));
        assert!(text.contains("sharedquota_admission_denied_total 3"));
        assert!(text.contains("sharedquota_reconcile_queue_depth 5"));
    }
}
