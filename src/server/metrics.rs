use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all pool metrics
const PREFIX: &str = "podcast_pool";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Queue Metrics
    pub static ref QUEUE_JOBS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_jobs"), "Jobs currently queued, by status"),
        &["status"]
    ).expect("Failed to create queue_jobs metric");

    pub static ref QUEUE_WORKERS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_workers"), "Connected workers, by status"),
        &["status"]
    ).expect("Failed to create queue_workers metric");

    pub static ref JOB_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_attempts_total"), "Settled job attempts, by outcome"),
        &["outcome"]
    ).expect("Failed to create job_attempts_total metric");

    pub static ref JOB_ATTEMPT_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_attempt_duration_seconds"),
            "Time from dispatch to settlement of a job attempt"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["outcome"]
    ).expect("Failed to create job_attempt_duration_seconds metric");

    pub static ref SCHEDULING_DEFECTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_scheduling_defects_total"), "Attempts aborted by a scheduling defect"),
        &["code"]
    ).expect("Failed to create scheduling_defects_total metric");

    // Connection Metrics
    pub static ref WS_CONNECTIONS: IntGauge = IntGauge::new(
        format!("{PREFIX}_ws_connections"),
        "Open WebSocket connections"
    ).expect("Failed to create ws_connections metric");

    pub static ref AUTH_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_auth_failures_total"), "Rejected connection attempts"),
        &["reason"]
    ).expect("Failed to create auth_failures_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_WORKERS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_ATTEMPT_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULING_DEFECTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WS_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(AUTH_FAILURES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Update the queue gauges
pub fn set_queue_sizes(waiting: usize, ongoing: usize, available: usize, busy: usize) {
    QUEUE_JOBS.with_label_values(&["waiting"]).set(waiting as f64);
    QUEUE_JOBS.with_label_values(&["ongoing"]).set(ongoing as f64);
    QUEUE_WORKERS
        .with_label_values(&["available"])
        .set(available as f64);
    QUEUE_WORKERS.with_label_values(&["busy"]).set(busy as f64);
}

/// Record a settled attempt; `outcome` is one of done, retry, failed
pub fn record_job_attempt(outcome: &str, duration: Duration) {
    JOB_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
    JOB_ATTEMPT_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn record_scheduling_defect(code: &str) {
    SCHEDULING_DEFECTS_TOTAL.with_label_values(&[code]).inc();
}

pub fn set_ws_connections(count: usize) {
    WS_CONNECTIONS.set(count as i64);
}

pub fn record_auth_failure(reason: &str) {
    AUTH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
