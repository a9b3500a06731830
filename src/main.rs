// =============================================================================
// BOOKING SERVICE - Main Entry Point
// =============================================================================
// Booking core for inflatable/party rental businesses.
//
// WHAT THIS SERVICE DOES:
// - Reserves inventory as time-limited HOLD bookings without over-allocation
// - Edits, confirms, completes and cancels bookings in serializable
//   transactions with bounded retry
// - Voids invoices and cancels quotes at the billing provider when the
//   booking behind them changes
// - Publishes booking/waiver change events to Redis after commit
// - Releases expired holds in the background
// =============================================================================

mod availability; // Conflict checker (availability.rs)
mod billing; // Billing provider client (billing.rs)
mod bookings; // Transactional update engine (bookings.rs)
mod clock; // Time source (clock.rs)
mod config; // Configuration loading (config.rs)
mod db; // PostgreSQL store (db.rs)
mod error; // Error types (error.rs)
mod handlers; // HTTP request handlers (handlers.rs)
mod holds; // Reservations and hold expiry (holds.rs)
mod metrics; // Prometheus metrics setup (metrics.rs)
mod models; // Data structures (models.rs)
mod publisher; // Realtime change events (publisher.rs)
mod reconcile; // Invoice/quote invalidation (reconcile.rs)
mod retry; // Transaction retry policy (retry.rs)
mod store; // Data-access traits (store.rs)

#[cfg(test)]
mod testing;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::billing::{BillingProvider, LoggingBilling, StripeBilling};
use crate::bookings::BookingService;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::Database;
use crate::holds::spawn_hold_sweeper;
use crate::metrics::setup_metrics;
use crate::publisher::RedisPublisher;
use crate::retry::RetryPolicy;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct AppState {
    /// Pool-level access: inventory listing, health checks
    pub db: Database,

    /// Redis connection for readiness checks
    pub redis: redis::aio::ConnectionManager,

    /// Renders `/metrics`
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    pub bookings: BookingService<Database>,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG overrides the default filter.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,booking_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Booking Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        hold_ttl_minutes = config.hold_ttl_minutes,
        tx_max_attempts = config.tx_max_attempts,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    if config.seed_demo_data {
        db.seed_demo_data().await?;
    }

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Wire the booking core
    // -------------------------------------------------------------------------
    let billing: Arc<dyn BillingProvider> = match &config.stripe_secret_key {
        Some(key) => {
            info!(api_base = %config.stripe_api_base, "Stripe billing enabled");
            Arc::new(StripeBilling::new(&config.stripe_api_base, key)?)
        }
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set; billing calls will only be logged");
            Arc::new(LoggingBilling)
        }
    };

    let bookings = BookingService::new(
        db.clone(),
        billing,
        Arc::new(RedisPublisher::new(
            redis_conn.clone(),
            &config.realtime_channel_prefix,
        )),
        Arc::new(SystemClock),
        RetryPolicy::new(
            config.tx_max_attempts,
            Duration::from_millis(config.tx_retry_backoff_ms),
        ),
        chrono::Duration::minutes(config.hold_ttl_minutes),
    );

    spawn_hold_sweeper(
        bookings.clone(),
        Duration::from_secs(config.hold_sweep_interval_secs.max(1)),
    );
    info!(
        interval_secs = config.hold_sweep_interval_secs,
        "Hold sweeper started"
    );

    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        metrics_handle,
        bookings,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Inventory & Availability -----
        .route("/api/v1/inventory", get(handlers::list_inventory))
        .route("/api/v1/availability", post(handlers::check_availability))
        // ----- Bookings -----
        .route("/api/v1/bookings/reserve", post(handlers::reserve_booking))
        .route(
            "/api/v1/bookings/:booking_id",
            get(handlers::get_booking).patch(handlers::update_booking),
        )
        .route("/api/v1/bookings/:booking_id/confirm", post(handlers::confirm_booking))
        .route("/api/v1/bookings/:booking_id/cancel", post(handlers::cancel_booking))
        .route("/api/v1/bookings/:booking_id/complete", post(handlers::complete_booking))
        .route("/api/v1/bookings/:booking_id/invoice", post(handlers::attach_invoice))
        .route("/api/v1/bookings/:booking_id/quote", post(handlers::attach_quote))
        .route("/api/v1/bookings/:booking_id/waivers", post(handlers::sign_waiver))
        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Booking Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
