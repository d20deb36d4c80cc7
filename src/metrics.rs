#![forbid(unsafe_code)]

// Server metrics: atomic counters plus a request latency histogram, rendered as Prometheus text.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bucket bounds in microseconds, paired with their `le` label.
const BUCKETS: [(u64, &str); 10] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (1_000_000, "1"),
    (5_000_000, "5"),
    (10_000_000, "10"),
];

/// Cumulative histogram with fixed buckets.
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide metrics. Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    peers_joined_total: AtomicU64,
    peers_left_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    consumer_close_notifications_total: AtomicU64,

    connections_active: AtomicU64,

    request_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                requests_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                peers_joined_total: AtomicU64::new(0),
                peers_left_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                consumer_close_notifications_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_requests(&self) {
        self.inner.requests_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_peers_joined(&self) {
        self.inner.peers_joined_total.fetch_add(1, Relaxed);
    }

    pub fn inc_peers_left(&self) {
        self.inner.peers_left_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumer_close_notifications(&self) {
        self.inner
            .consumer_close_notifications_total
            .fetch_add(1, Relaxed);
    }

    pub fn errors_total(&self) -> u64 {
        self.inner.errors_total.load(Relaxed)
    }

    pub fn consumer_close_notifications_total(&self) -> u64 {
        self.inner.consumer_close_notifications_total.load(Relaxed)
    }

    /// Bumps the active connection gauge until the guard is dropped.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Prometheus text exposition. Room and peer gauges are sampled by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        let counters = [
            ("streamrooms_connections_total", "Total WebSocket connections", &i.connections_total),
            ("streamrooms_requests_total", "Total signaling requests handled", &i.requests_total),
            ("streamrooms_errors_total", "Total error replies", &i.errors_total),
            ("streamrooms_rooms_created_total", "Total rooms created", &i.rooms_created_total),
            ("streamrooms_peers_joined_total", "Total peers joined", &i.peers_joined_total),
            ("streamrooms_peers_left_total", "Total peers left", &i.peers_left_total),
            ("streamrooms_producers_created_total", "Total producers created", &i.producers_created_total),
            ("streamrooms_consumers_created_total", "Total consumers created", &i.consumers_created_total),
            (
                "streamrooms_consumer_close_notifications_total",
                "Total consumer-close notifications delivered",
                &i.consumer_close_notifications_total,
            ),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, name, help, "counter", value.load(Relaxed));
        }

        render_metric(
            &mut out,
            "streamrooms_connections_active",
            "Currently open WebSocket connections",
            "gauge",
            i.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "streamrooms_rooms_active", "Currently open rooms", "gauge", rooms_active as u64);
        render_metric(&mut out, "streamrooms_peers_active", "Currently joined peers", "gauge", peers_active as u64);

        i.request_handling.render(
            "streamrooms_request_handling_seconds",
            "Signaling request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
