//! In-process metrics registry with Prometheus-style text export
//!
//! Counters and gauges are plain atomics; histograms wrap `hdrhistogram`
//! behind a mutex (recorded off the hot path or from worker threads).
//! The registry is a process-wide singleton with explicit init.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Monotone counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Signed instantaneous gauge
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Set the current value
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Add a delta
    pub fn add(&self, d: i64) {
        self.value.fetch_add(d, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram, microsecond precision up to one minute
#[derive(Debug)]
pub struct Histogram {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl Histogram {
    fn new() -> Self {
        let h = hdrhistogram::Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("static histogram bounds");
        Self {
            inner: Mutex::new(h),
        }
    }

    /// Record one observation in microseconds
    pub fn record_micros(&self, us: u64) {
        let mut h = self.inner.lock();
        let _ = h.record(us.clamp(1, 60_000_000));
    }

    /// Value at a quantile in `[0, 1]`
    #[must_use]
    pub fn quantile(&self, q: f64) -> u64 {
        self.inner.lock().value_at_quantile(q)
    }

    /// Number of recorded observations
    #[must_use]
    pub fn count(&self) -> u64 {
        self.inner.lock().len()
    }
}

/// Named metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<FxHashMap<String, Arc<Counter>>>,
    gauges: Mutex<FxHashMap<String, Arc<Gauge>>>,
    histograms: Mutex<FxHashMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create a counter by name
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut map = self.counters.lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Counter::default())),
        )
    }

    /// Fetch or create a gauge by name
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut map = self.gauges.lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Gauge::default())),
        )
    }

    /// Fetch or create a histogram by name
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        let mut map = self.histograms.lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::new())),
        )
    }

    /// Render all metrics in Prometheus text exposition format
    ///
    /// Histograms export p50/p99/p999 quantile gauges plus a `_count`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut counters: Vec<_> = {
            let map = self.counters.lock();
            map.iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect()
        };
        counters.sort();
        for (name, value) in counters {
            let _ = writeln!(out, "# TYPE {name} counter\n{name} {value}");
        }

        let mut gauges: Vec<_> = {
            let map = self.gauges.lock();
            map.iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect()
        };
        gauges.sort();
        for (name, value) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge\n{name} {value}");
        }

        let hists: Vec<_> = {
            let map = self.histograms.lock();
            map.iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };
        let mut hists = hists;
        hists.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, h) in hists {
            let _ = writeln!(out, "# TYPE {name} summary");
            for (label, q) in [("0.5", 0.5), ("0.99", 0.99), ("0.999", 0.999)] {
                let _ = writeln!(out, "{name}{{quantile=\"{label}\"}} {}", h.quantile(q));
            }
            let _ = writeln!(out, "{name}_count {}", h.count());
        }
        out
    }
}

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Install the process-wide registry; called once from the engine entry point
pub fn init() {
    let _ = GLOBAL.set(Arc::new(MetricsRegistry::new()));
}

/// The process-wide registry
///
/// Every subsystem records into this one instance, so a single `render`
/// covers the whole process.
///
/// # Panics
/// Panics when [`init`] has not run; singletons never self-initialize.
#[must_use]
pub fn global() -> Arc<MetricsRegistry> {
    Arc::clone(GLOBAL.get().expect("metrics::init must run before use"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges() {
        let reg = MetricsRegistry::new();
        let c = reg.counter("orders_total");
        c.inc();
        c.add(2);
        assert_eq!(c.get(), 3);
        // same name, same instance
        assert_eq!(reg.counter("orders_total").get(), 3);

        let g = reg.gauge("queue_depth");
        g.set(5);
        g.add(-2);
        assert_eq!(g.get(), 3);
    }

    #[test]
    fn histogram_quantiles() {
        let reg = MetricsRegistry::new();
        let h = reg.histogram("rtt_us");
        for v in 1..=1000 {
            h.record_micros(v);
        }
        assert_eq!(h.count(), 1000);
        let p50 = h.quantile(0.5);
        assert!((450..=550).contains(&p50), "p50 was {p50}");
    }

    #[test]
    fn global_hands_out_one_shared_registry() {
        init();
        global().counter("global_probe_total").inc();
        // A second handle observes the same instance.
        assert_eq!(global().counter("global_probe_total").get(), 1);
        assert!(global().render().contains("global_probe_total 1"));
    }

    #[test]
    fn render_is_sorted_text() {
        let reg = MetricsRegistry::new();
        reg.counter("b_total").inc();
        reg.counter("a_total").inc();
        reg.gauge("depth").set(7);
        reg.histogram("lat_us").record_micros(100);
        let text = reg.render();
        let a = text.find("a_total 1").unwrap();
        let b = text.find("b_total 1").unwrap();
        assert!(a < b);
        assert!(text.contains("depth 7"));
        assert!(text.contains("lat_us_count 1"));
    }
}
