//! Metric handles and the registry holding them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

/// Default latency buckets, in milliseconds.
pub const LATENCY_BUCKETS_MS: &[f64] = &[5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0];

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Value that can go up and down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// Non-cumulative; one extra slot for `+Inf`.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// f64 bits.
    sum: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// `(upper bound, cumulative count)` pairs, ending with `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| {
                total += b.load(Ordering::Relaxed);
                (self.bounds.get(i).copied().unwrap_or(f64::INFINITY), total)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One labelled series of a family.
#[derive(Debug, Clone)]
pub enum Series {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
}

type Labels = Vec<(String, String)>;

#[derive(Debug)]
pub(crate) struct Family {
    pub(crate) help: String,
    pub(crate) kind: MetricKind,
    pub(crate) series: BTreeMap<Labels, Series>,
}

/// Registry of every metric family of a node.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

fn owned_labels(labels: &[(&str, &str)]) -> Labels {
    let mut out: Labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    out.sort();
    out
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        labels: &[(&str, &str)],
        make: impl FnOnce() -> Series,
    ) -> Option<Series> {
        let labels = owned_labels(labels);
        if let Some(family) = self.families.read().get(name) {
            if family.kind == kind {
                if let Some(series) = family.series.get(&labels) {
                    return Some(series.clone());
                }
            }
        }

        let mut families = self.families.write();
        let family = families.entry(name.to_string()).or_insert_with(|| Family {
            help: help.to_string(),
            kind,
            series: BTreeMap::new(),
        });
        if family.kind != kind {
            warn!(metric = name, "metric registered with a different kind");
            return None;
        }
        Some(family.series.entry(labels).or_insert_with(make).clone())
    }

    /// Get or create a counter series.
    pub fn counter(&self, name: &str, help: &str, labels: &[(&str, &str)]) -> Arc<Counter> {
        match self.series(name, help, MetricKind::Counter, labels, || {
            Series::Counter(Arc::default())
        }) {
            Some(Series::Counter(c)) => c,
            _ => Arc::default(),
        }
    }

    /// Get or create a gauge series.
    pub fn gauge(&self, name: &str, help: &str, labels: &[(&str, &str)]) -> Arc<Gauge> {
        match self.series(name, help, MetricKind::Gauge, labels, || {
            Series::Gauge(Arc::default())
        }) {
            Some(Series::Gauge(g)) => g,
            _ => Arc::default(),
        }
    }

    /// Get or create a histogram series with the given bucket bounds.
    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        bounds: &[f64],
    ) -> Arc<Histogram> {
        match self.series(name, help, MetricKind::Histogram, labels, || {
            Series::Histogram(Arc::new(Histogram::new(bounds)))
        }) {
            Some(Series::Histogram(h)) => h,
            _ => Arc::new(Histogram::new(bounds)),
        }
    }

    /// Current value of a counter series, if registered.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let families = self.families.read();
        match families.get(name)?.series.get(&owned_labels(labels))? {
            Series::Counter(c) => Some(c.get()),
            _ => None,
        }
    }

    /// Current value of a gauge series, if registered.
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let families = self.families.read();
        match families.get(name)?.series.get(&owned_labels(labels))? {
            Series::Gauge(g) => Some(g.get()),
            _ => None,
        }
    }

    pub(crate) fn with_families<R>(&self, f: impl FnOnce(&BTreeMap<String, Family>) -> R) -> R {
        f(&self.families.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_series_is_shared() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("remote_out_count", "Forwarded records.", &[("dest", "n1:1")]);
        let b = registry.counter("remote_out_count", "Forwarded records.", &[("dest", "n1:1")]);
        a.inc();
        b.add(2);
        assert_eq!(registry.counter_value("remote_out_count", &[("dest", "n1:1")]), Some(3));
        assert_eq!(registry.counter_value("remote_out_count", &[("dest", "n2:1")]), None);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let registry = MetricsRegistry::new();
        registry.counter("c", "", &[("a", "1"), ("b", "2")]).inc();
        registry.counter("c", "", &[("b", "2"), ("a", "1")]).inc();
        assert_eq!(registry.counter_value("c", &[("a", "1"), ("b", "2")]), Some(2));
    }

    #[test]
    fn kind_conflict_returns_detached_handle() {
        let registry = MetricsRegistry::new();
        registry.gauge("cluster_size", "", &[]).set(3);
        let c = registry.counter("cluster_size", "", &[]);
        c.add(10);
        assert_eq!(registry.gauge_value("cluster_size", &[]), Some(3));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(&[10.0, 100.0]);
        h.observe(1.0);
        h.observe(50.0);
        h.observe(500.0);
        assert_eq!(h.count(), 3);
        assert_eq!(h.sum(), 551.0);
        assert_eq!(
            h.cumulative(),
            vec![(10.0, 1), (100.0, 2), (f64::INFINITY, 3)]
        );
    }
}
