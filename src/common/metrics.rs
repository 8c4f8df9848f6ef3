//! Prometheus-compatible metrics
//!
//! - Request latency histograms and per-endpoint counters
//! - Proposal, connect and tablet counters
//! - Cluster shape gauges refreshed on every scrape

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        // Microseconds, to keep sub-millisecond precision in an integer.
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf.
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment now, decrement when the guard drops.
    pub fn track(&self) -> GaugeGuard<'_> {
        self.inc();
        GaugeGuard(self)
    }
}

pub struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_success: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    pub total_requests: Counter,
    pub total_errors: Counter,

    pub proposals_total: Counter,
    pub proposals_failed: Counter,
    pub connects_total: Counter,
    pub tablets_claimed: Counter,
    pub tablets_moved: Counter,

    pub active_streams: Gauge,
    pub groups: Gauge,
    pub members: Gauge,
    pub tablets: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            proposals_total: Counter::new(),
            proposals_failed: Counter::new(),
            connects_total: Counter::new(),
            tablets_claimed: Counter::new(),
            tablets_moved: Counter::new(),
            active_streams: Gauge::new(),
            groups: Gauge::new(),
            members: Gauge::new(),
            tablets: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        self.endpoints
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        self.total_requests.inc();
        if success {
            endpoint.requests_success.inc();
        } else {
            endpoint.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let scalars: [(&str, &str, &str, u64); 12] = [
            ("requests_total", "counter", "Total number of requests", self.total_requests.get()),
            ("errors_total", "counter", "Total number of errors", self.total_errors.get()),
            ("proposals_total", "counter", "Proposals submitted to consensus", self.proposals_total.get()),
            ("proposals_failed_total", "counter", "Proposals that failed or were rejected", self.proposals_failed.get()),
            ("connects_total", "counter", "Connect requests handled", self.connects_total.get()),
            ("tablets_claimed_total", "counter", "Tablets claimed through ShouldServe", self.tablets_claimed.get()),
            ("tablets_moved_total", "counter", "Tablets moved by the rebalancer", self.tablets_moved.get()),
            ("active_streams", "gauge", "Open membership streams", self.active_streams.get()),
            ("groups", "gauge", "Known data groups", self.groups.get()),
            ("members", "gauge", "Registered data-group members", self.members.get()),
            ("tablets", "gauge", "Assigned tablets", self.tablets.get()),
            ("uptime_seconds", "gauge", "Server uptime in seconds", self.uptime_seconds()),
        ];
        for (name, kind, help, value) in scalars {
            let _ = writeln!(out, "# HELP minizero_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minizero_{} {}", name, kind);
            let _ = writeln!(out, "minizero_{} {}", name, value);
        }

        let endpoints = self.endpoints.lock();
        out.push_str("# HELP minizero_endpoint_requests_total Requests per endpoint\n");
        out.push_str("# TYPE minizero_endpoint_requests_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "minizero_endpoint_requests_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_total.get()
            );
        }
        out.push_str("# HELP minizero_endpoint_errors_total Errors per endpoint\n");
        out.push_str("# TYPE minizero_endpoint_errors_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "minizero_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }

        out.push_str("# HELP minizero_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE minizero_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "minizero_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "minizero_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "minizero_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
