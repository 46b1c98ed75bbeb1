//! Prometheus metrics for fees-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for reconciliation outcomes.
pub static RECONCILIATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_reconciliations_total",
        "Total number of payment reconciliations",
        &["status"]
    )
    .expect("Failed to register RECONCILIATIONS")
});

/// Counter for allocation records by target (invoice or credit).
pub static ALLOCATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_allocations_total",
        "Total number of allocation records written",
        &["target"]
    )
    .expect("Failed to register ALLOCATIONS")
});

/// Counter for credit application outcomes.
pub static CREDIT_APPLICATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_credit_applications_total",
        "Total number of credit applications to invoices",
        &["status"]
    )
    .expect("Failed to register CREDIT_APPLICATIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fees_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for errors by type.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&RECONCILIATIONS);
    Lazy::force(&ALLOCATIONS);
    Lazy::force(&CREDIT_APPLICATIONS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record a reconciliation outcome.
pub fn record_reconciliation(status: &str) {
    RECONCILIATIONS.with_label_values(&[status]).inc();
}

/// Record allocation records written against a target.
pub fn record_allocations(target: &str, count: u64) {
    ALLOCATIONS.with_label_values(&[target]).inc_by(count as f64);
}

/// Record a credit application outcome.
pub fn record_credit_application(status: &str) {
    CREDIT_APPLICATIONS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
