//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Inbound Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOUND_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_inbound_outcomes_total", "Inbound activities by final outcome"),
        &["outcome"]
    ).expect("metric can be created");

    // Outbound Metrics
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["verb", "status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "friends_federation_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["verb"]
    ).expect("metric can be created");
    pub static ref QUEUE_PENDING: IntGauge = IntGauge::new(
        "friends_federation_queue_pending",
        "Current number of pending delivery jobs"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("friends_federation_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_RECEIVED.clone()))
            .expect("ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(INBOUND_OUTCOMES.clone()))
            .expect("INBOUND_OUTCOMES can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_SENT.clone()))
            .expect("ACTIVITIES_SENT can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
            .expect("DELIVERY_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(QUEUE_PENDING.clone()))
            .expect("QUEUE_PENDING can be registered");
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("CACHE_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("CACHE_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
