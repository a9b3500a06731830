// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers. Each booking handler is a thin shell around one
// `BookingService` operation: extract, call, record metrics, respond.
// Errors become responses in `AppError::into_response`.
//
// Routes addressing one booking are scoped by the `businessId` query
// parameter; a booking owned by another business answers 404.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::*;
use crate::AppState;

/// Count a request and its latency under the route pattern.
fn record<T>(method: &str, endpoint: &str, start: Instant, result: &AppResult<T>) {
    let status = match result {
        Ok(_) => StatusCode::OK.as_u16(),
        Err(err) => err.status().as_u16(),
    };
    metrics::record_http_request(method, endpoint, status, start.elapsed().as_secs_f64());
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "booking-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: PostgreSQL and Redis reachable
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let start = Instant::now();
    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();
    metrics::record_redis_operation("ping", start.elapsed().as_secs_f64());

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        tracing::warn!(database = db_healthy, redis = redis_healthy, "Readiness check failed");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// INVENTORY & AVAILABILITY
// =============================================================================

/// List a business's inventory ledger
///
/// GET /api/v1/inventory?businessId=...
pub async fn list_inventory(
    State(state): State<Arc<AppState>>,
    Query(scope): Query<BusinessScope>,
) -> AppResult<Json<InventoryListResponse>> {
    let start = Instant::now();
    let result = state.db.list_inventory(scope.business_id).await;
    record("GET", "/api/v1/inventory", start, &result);

    Ok(Json(InventoryListResponse { items: result? }))
}

/// Read-only availability check
///
/// POST /api/v1/availability
///
/// # Response
/// - 200 `{"available": true}`
/// - 409 `{"error": "CONFLICT", "message": "...", "inventoryId": "..."}`
pub async fn check_availability(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AvailabilityRequest>,
) -> AppResult<Json<AvailabilityResponse>> {
    let start = Instant::now();
    let result = state.bookings.check_availability(&request).await;
    record("POST", "/api/v1/availability", start, &result);

    result?;
    Ok(Json(AvailabilityResponse { available: true }))
}

// =============================================================================
// BOOKING ENDPOINTS
// =============================================================================

/// Reserve items as a HOLD booking
///
/// POST /api/v1/bookings/reserve
///
/// # Request Body
/// ```json
/// {
///   "businessId": "...",
///   "items": [{"inventoryId": "...", "quantity": 1,
///              "startUTC": "2024-06-01T10:00:00Z", "endUTC": "2024-06-01T14:00:00Z"}],
///   "eventDetails": {"startTime": "...", "endTime": "...", "timezone": "America/Chicago"}
/// }
/// ```
///
/// # Response
/// `{"bookingId": "...", "expiresAt": "..."}`
pub async fn reserve_booking(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReserveRequest>,
) -> AppResult<Json<ReserveResponse>> {
    let start = Instant::now();
    let result = state.bookings.reserve(&request).await;
    record("POST", "/api/v1/bookings/reserve", start, &result);

    Ok(Json(result?))
}

/// GET /api/v1/bookings/:booking_id?businessId=...
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state.bookings.get_booking(scope.business_id, booking_id).await;
    record("GET", "/api/v1/bookings/:booking_id", start, &result);

    Ok(Json(result?))
}

/// Edit a HOLD or PENDING booking
///
/// PATCH /api/v1/bookings/:booking_id?businessId=...
pub async fn update_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
    Json(request): Json<UpdateBookingRequest>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state
        .bookings
        .update_booking(scope.business_id, booking_id, &request)
        .await;
    record("PATCH", "/api/v1/bookings/:booking_id", start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/bookings/:booking_id/cancel?businessId=...
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state.bookings.cancel_booking(scope.business_id, booking_id).await;
    record("POST", "/api/v1/bookings/:booking_id/cancel", start, &result);

    Ok(Json(result?))
}

/// Record a payment against a HOLD (or PENDING) booking
///
/// POST /api/v1/bookings/:booking_id/confirm?businessId=...
pub async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
    Json(request): Json<ConfirmBookingRequest>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state
        .bookings
        .confirm_booking(scope.business_id, booking_id, &request)
        .await;
    record("POST", "/api/v1/bookings/:booking_id/confirm", start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/bookings/:booking_id/complete?businessId=...
pub async fn complete_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state.bookings.complete_booking(scope.business_id, booking_id).await;
    record("POST", "/api/v1/bookings/:booking_id/complete", start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/bookings/:booking_id/invoice?businessId=...
pub async fn attach_invoice(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
    Json(request): Json<AttachInvoiceRequest>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state
        .bookings
        .attach_invoice(scope.business_id, booking_id, &request)
        .await;
    record("POST", "/api/v1/bookings/:booking_id/invoice", start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/bookings/:booking_id/quote?businessId=...
pub async fn attach_quote(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
    Json(request): Json<AttachQuoteRequest>,
) -> AppResult<Json<BookingDetails>> {
    let start = Instant::now();
    let result = state
        .bookings
        .attach_quote(scope.business_id, booking_id, &request)
        .await;
    record("POST", "/api/v1/bookings/:booking_id/quote", start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/bookings/:booking_id/waivers?businessId=...
pub async fn sign_waiver(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<Uuid>,
    Query(scope): Query<BusinessScope>,
    Json(request): Json<SignWaiverRequest>,
) -> AppResult<(StatusCode, Json<Waiver>)> {
    let start = Instant::now();
    let result = state
        .bookings
        .sign_waiver(scope.business_id, booking_id, &request)
        .await;
    record("POST", "/api/v1/bookings/:booking_id/waivers", start, &result);

    Ok((StatusCode::CREATED, Json(result?)))
}
