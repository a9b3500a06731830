// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the booking service, scraped from `/metrics`.
//
// - Counter: booking operation outcomes, transaction retries, conflicts,
//   released holds, published change events
// - Histogram: HTTP, database and Redis latency
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use uuid::Uuid;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Booking operations by outcome
/// Labels: operation (reserve/update_booking/...), outcome (ok/CONFLICT/...)
pub const BOOKING_OPERATIONS_TOTAL: &str = "booking_operations_total";

/// Transaction re-runs after a serialization failure or billing error
/// Labels: operation
pub const BOOKING_TRANSACTION_RETRIES_TOTAL: &str = "booking_transaction_retries_total";

/// Requests rejected for lack of capacity
/// Labels: inventory_id
pub const BOOKING_AVAILABILITY_CONFLICTS_TOTAL: &str = "booking_availability_conflicts_total";

/// Expired holds cancelled by the sweeper
pub const BOOKING_HOLDS_EXPIRED_TOTAL: &str = "booking_holds_expired_total";

/// Realtime change events
/// Labels: entity (booking/waiver), status (success/failed)
pub const BOOKING_CHANGE_EVENTS_TOTAL: &str = "booking_change_events_total";

/// Database query duration histogram
/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (publish/ping)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder.
///
/// # Returns
/// * `PrometheusHandle` - renders the text exposition format for `/metrics`
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(
        BOOKING_OPERATIONS_TOTAL,
        "Booking operations by outcome"
    );
    describe_counter!(
        BOOKING_TRANSACTION_RETRIES_TOTAL,
        "Booking transactions re-run after a transient failure"
    );
    describe_counter!(
        BOOKING_AVAILABILITY_CONFLICTS_TOTAL,
        "Requests rejected because inventory was fully booked"
    );
    describe_counter!(
        BOOKING_HOLDS_EXPIRED_TOTAL,
        "Expired holds cancelled by the sweeper"
    );
    describe_counter!(
        BOOKING_CHANGE_EVENTS_TOTAL,
        "Realtime change events published"
    );
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (GET, POST, etc.)
/// * `endpoint` - Route pattern (/api/v1/bookings/:booking_id)
/// * `status` - Response status code
/// * `duration_secs` - Request duration in seconds
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_booking_operation(operation: &str, outcome: &str) {
    counter!(
        BOOKING_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_transaction_retry(operation: &str) {
    counter!(
        BOOKING_TRANSACTION_RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_availability_conflict(inventory_id: Option<&Uuid>) {
    let inventory_id = inventory_id.map_or_else(|| "unknown".to_string(), Uuid::to_string);
    counter!(
        BOOKING_AVAILABILITY_CONFLICTS_TOTAL,
        "inventory_id" => inventory_id
    )
    .increment(1);
}

pub fn record_holds_expired(count: usize) {
    counter!(BOOKING_HOLDS_EXPIRED_TOTAL).increment(count as u64);
}

pub fn record_change_event(entity: &str, success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        BOOKING_CHANGE_EVENTS_TOTAL,
        "entity" => entity.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record database query duration
///
/// # Arguments
/// * `operation` - Query name (committed_items, update_booking, ...)
/// * `duration_secs` - Query duration in seconds
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
