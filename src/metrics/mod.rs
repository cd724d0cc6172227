//! Prometheus metrics for the proxy.
//!
//! All counters and histograms live here as process-wide statics in a
//! single registry; the other components only ever increment them.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};

mod server;

pub use server::start_metrics_server;

pub(crate) static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Queries routed through the proxy, labeled by the `file`/`line`
/// hints, the statement kind, and whether the cache answered.
pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "tqdbproxy_queries_total",
            "Queries handled, labeled by hinted file/line, statement kind, and cached/uncached.",
        ),
        &["file", "line", "kind", "cached"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static QUERY_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tqdbproxy_query_latency_seconds",
            "End-to-end latency of one client statement.",
        )
        .buckets(exponential_buckets(0.0001, 2.0, 18).unwrap()),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "tqdbproxy_cache_hits_total",
        "Cacheable reads answered from the query cache.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "tqdbproxy_cache_misses_total",
        "Cacheable reads that had to consult a backend.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static CACHE_STALE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "tqdbproxy_cache_stale_total",
        "Cacheable reads served stale bytes during a refresh.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Statements the proxy itself sent to a backend, labeled by the pool
/// member that served them ("primary", "replicas[0]", ...).
pub static BACKEND_QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "tqdbproxy_backend_queries_total",
            "Backend round-trips, labeled by pool member.",
        ),
        &["backend"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tqdbproxy_batch_size",
            "Number of writes coalesced into one flushed batch.",
        )
        .buckets(exponential_buckets(1.0, 2.0, 11).unwrap()),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static BATCH_DELAY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tqdbproxy_batch_delay_seconds",
            "Time a write waited in its group before the flush started.",
        )
        .buckets(exponential_buckets(0.0001, 2.0, 16).unwrap()),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static BATCH_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tqdbproxy_batch_latency_seconds",
            "Time spent executing one flushed batch on the backend.",
        )
        .buckets(exponential_buckets(0.0001, 2.0, 16).unwrap()),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static BATCHED_WRITES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "tqdbproxy_batched_writes_total",
        "Writes that went through the batcher, monotonic.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Client connections accepted, by dialect listener.
pub static CLIENT_CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "tqdbproxy_client_connections_total",
            "Client connections accepted, labeled by dialect.",
        ),
        &["dialect"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Record one routed statement against the per-file/line counter.
pub fn observe_query(file: Option<&str>, line: Option<u32>, kind: &str, cached: bool) {
    let line = line.map(|l| l.to_string()).unwrap_or_default();
    QUERIES_TOTAL
        .with_label_values(&[
            file.unwrap_or(""),
            line.as_str(),
            kind,
            if cached { "cached" } else { "uncached" },
        ])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_query_labels() {
        observe_query(Some("app.go"), Some(42), "select", true);
        observe_query(None, None, "insert", false);

        let cached = QUERIES_TOTAL
            .with_label_values(&["app.go", "42", "select", "cached"])
            .get();
        assert!(cached >= 1);
    }

    #[test]
    fn test_registry_gathers_everything() {
        // Touch the statics so they register.
        CACHE_HITS_TOTAL.inc();
        CACHE_MISSES_TOTAL.inc();
        CACHE_STALE_TOTAL.inc();
        BATCH_SIZE.observe(4.0);
        BATCH_DELAY_SECONDS.observe(0.001);
        BATCH_LATENCY_SECONDS.observe(0.002);
        BATCHED_WRITES_TOTAL.inc();
        BACKEND_QUERIES_TOTAL.with_label_values(&["primary"]).inc();
        CLIENT_CONNECTIONS_TOTAL.with_label_values(&["mysql"]).inc();
        QUERY_LATENCY_SECONDS.observe(0.01);

        let families = REGISTRY.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"tqdbproxy_cache_hits_total"));
        assert!(names.contains(&"tqdbproxy_batch_size"));
        assert!(names.contains(&"tqdbproxy_batched_writes_total"));
    }
}
