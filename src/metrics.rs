//! Prometheus metrics for the archival service.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

#[allow(missing_docs)]
lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fdroidswh_http_requests_total",
        "Total number of HTTP requests to the status server",
        &["method", "endpoint", "status"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "fdroidswh_http_request_duration_seconds",
        "Status server request duration in seconds",
        &["method", "endpoint"]
    ).unwrap();

    /// Requests to the archive, by operation and result
    pub static ref SWH_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fdroidswh_swh_requests_total",
        "Total number of requests to the archival service",
        &["operation", "result"]
    ).unwrap();

    /// Packages processed, by final outcome
    pub static ref PACKAGES_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fdroidswh_packages_processed_total",
        "Total number of packages processed by the scheduler",
        &["outcome"]
    ).unwrap();

    pub static ref PACKAGES_IN_FLIGHT: IntGauge = register_int_gauge!(
        "fdroidswh_packages_in_flight",
        "Number of packages holding a processing slot"
    ).unwrap();

    pub static ref BATCHES_TOTAL: IntCounter = register_int_counter!(
        "fdroidswh_batches_total",
        "Total number of scheduling cycles that selected work"
    ).unwrap();

    pub static ref INDEX_DOWNLOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fdroidswh_index_downloads_total",
        "Index change checks, by result",
        &["result"]
    ).unwrap();

    pub static ref INDEX_PACKAGES_LOADED_TOTAL: IntCounter = register_int_counter!(
        "fdroidswh_index_packages_loaded_total",
        "Total number of package records ingested from the index"
    ).unwrap();
}

/// Metrics collection helper functions
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration: f64) {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        HTTP_REQUEST_DURATION
            .with_label_values(&[method, endpoint])
            .observe(duration);
    }

    /// `result` is "ok", "rate_limited" or "error".
    pub fn record_swh_request(operation: &str, result: &str) {
        SWH_REQUESTS_TOTAL.with_label_values(&[operation, result]).inc();
    }

    pub fn record_package_outcome(outcome: &str) {
        PACKAGES_PROCESSED_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn set_in_flight(count: usize) {
        PACKAGES_IN_FLIGHT.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_batch() {
        BATCHES_TOTAL.inc();
    }

    /// `result` is one of "unchanged", "downloaded" or "error".
    pub fn record_index_check(result: &str) {
        INDEX_DOWNLOADS_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn record_index_load(packages: usize) {
        INDEX_PACKAGES_LOADED_TOTAL.inc_by(packages as u64);
    }

    /// Collect and return all metrics in Prometheus text format
    pub fn collect_metrics() -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode_to_string(&metric_families)
    }
}

/// Middleware for automatic HTTP metrics collection
pub async fn metrics_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let start = std::time::Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    MetricsCollector::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
