use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram over `f64` observations.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits, updated with compare-exchange.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Request-latency buckets, in seconds.
pub fn http_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Worker-run buckets, in seconds (10s .. 2h).
pub fn task_duration_buckets() -> Vec<f64> {
    vec![10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// `{key="value",...}`, or empty when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process metrics. Owned by the daemon and shared through an `Arc`.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector with the orchestration histograms pre-registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        collector.register_histogram("api_request_duration_seconds", http_duration_buckets());
        collector.register_histogram("task_duration_seconds", task_duration_buckets());
        collector
    }

    pub fn register_histogram(&self, name: &str, buckets: Vec<f64>) {
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(buckets));
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record into a histogram, creating it with HTTP buckets if unknown.
    pub fn record_histogram(&self, name: &str, value: f64) {
        if let Some(h) = read(&self.histograms).get(name) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(http_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, series sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));
            let mut last: Option<&String> = None;
            for (name, labels, value) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                    last = Some(name);
                }
                out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {name} gauge\n"));
                out.push_str(&format!("{name} {}\n", map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{name}_bucket{{le=\"{boundary}\"}} {}\n",
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|((name, labels), v)| {
                (
                    format!("{name}{}", labels.prometheus_str()),
                    serde_json::json!(v.load(Ordering::Relaxed)),
                )
            })
            .collect();

        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|(name, v)| (name.clone(), serde_json::json!(v.load(Ordering::Relaxed))))
            .collect();

        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    serde_json::json!({ "sum": h.sum(), "count": h.count() }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
