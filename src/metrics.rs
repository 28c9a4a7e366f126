//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "inkfed_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_activitypub_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "inkfed_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref KEYPAIRS_GENERATED_TOTAL: IntCounter = IntCounter::new(
        "inkfed_keypairs_generated_total",
        "Total number of blog keypairs generated"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Application Metrics
    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "inkfed_followers_total",
        "Remote follow edges created minus removed since startup"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inkfed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Registration failures are logged and the instrument keeps counting
/// without being exported.
pub fn init_metrics() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("HTTP_REQUESTS_TOTAL", Box::new(HTTP_REQUESTS_TOTAL.clone())),
        (
            "HTTP_REQUEST_DURATION_SECONDS",
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        ),
        (
            "ACTIVITYPUB_ACTIVITIES_RECEIVED",
            Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()),
        ),
        (
            "ACTIVITYPUB_ACTIVITIES_SENT",
            Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()),
        ),
        (
            "FEDERATION_REQUESTS_TOTAL",
            Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
        ),
        (
            "FEDERATION_REQUEST_DURATION_SECONDS",
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        ),
        (
            "KEYPAIRS_GENERATED_TOTAL",
            Box::new(KEYPAIRS_GENERATED_TOTAL.clone()),
        ),
        ("CACHE_HITS_TOTAL", Box::new(CACHE_HITS_TOTAL.clone())),
        ("CACHE_MISSES_TOTAL", Box::new(CACHE_MISSES_TOTAL.clone())),
        ("FOLLOWERS_TOTAL", Box::new(FOLLOWERS_TOTAL.clone())),
        ("ERRORS_TOTAL", Box::new(ERRORS_TOTAL.clone())),
    ];

    for (name, collector) in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::warn!(metric = name, %error, "Failed to register metric");
        }
    }

    tracing::info!("Metrics registry initialized");
}
