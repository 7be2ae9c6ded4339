//! Prometheus metrics for the gateway
//!
//! Registered against the default registry and served on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec, TextEncoder,
};

/// Total WebSocket tunnel connections, partitioned by outcome
pub static CONNECTION_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "websocket_connections_total",
        "Total number of WebSocket connections, partitioned by status.",
        &["status"]
    )
    .expect("metric registration")
});

/// Latency of proxied `/kubernetes` requests
pub static REQUEST_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "request_latency_seconds",
        "Request latency of the /kubernetes endpoint in seconds"
    )
    .expect("metric registration")
});

/// Time to retrieve a kubeconfig from the durable store
pub static KUBECONFIG_RETRIEVAL_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "kubeconfig_retrieval_duration_seconds",
        "Duration in seconds to retrieve a kubeconfig from the durable store"
    )
    .expect("metric registration")
});

/// HTTP response codes of proxied requests
pub static PROXIED_RESPONSE_CODES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "proxied_http_response_codes",
        "Count of HTTP response codes for proxied requests",
        &["code"]
    )
    .expect("metric registration")
});

/// Record a proxied response code
pub fn observe_response_code(code: u16) {
    PROXIED_RESPONSE_CODES
        .with_label_values(&[&code.to_string()])
        .inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
