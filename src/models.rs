// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures for the booking core: persisted rows (inventory, bookings,
// line items, billing artifacts, payments, waivers) and the API request and
// response shapes.
//
// Money is stored as integer cents (i64). Instants are UTC.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// STATUS ENUMS
// =============================================================================
// Each enum maps onto a PostgreSQL enum type created by the migrations.

/// Rentability of an inventory type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "inventory_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    Available,
    Maintenance,
    Retired,
}

/// Lifecycle of a booking (and, mirrored, of its line items)
///
/// ```text
/// HOLD ──payment──▶ PENDING / CONFIRMED ──fulfilled──▶ COMPLETED
///  │ ▲                 │
///  │ └──────edit───────┘
///  └──expiry/cancel──▶ CANCELLED ◀──cancel── PENDING / CONFIRMED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Hold,
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Only HOLD and PENDING bookings accept edits.
    pub fn is_editable(self) -> bool {
        matches!(self, BookingStatus::Hold | BookingStatus::Pending)
    }

    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            BookingStatus::Hold | BookingStatus::Pending | BookingStatus::Confirmed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Hold => "HOLD",
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Void,
    Paid,
}

impl InvoiceStatus {
    /// DRAFT and OPEN invoices can still be paid and must be voided when
    /// the booking behind them changes.
    pub fn is_active(self) -> bool {
        matches!(self, InvoiceStatus::Draft | InvoiceStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "quote_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Draft,
    Open,
    Canceled,
    Accepted,
}

impl QuoteStatus {
    pub fn is_active(self) -> bool {
        matches!(self, QuoteStatus::Draft | QuoteStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

// =============================================================================
// INVENTORY LEDGER
// =============================================================================
/// A rentable item type (e.g. "Castle-A") and how many physical units exist.
///
/// `quantity` is the hard capacity the availability checker compares against.
/// This service never writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,

    /// Category such as "bounce_house" or "water_slide"
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,

    /// Rental price per unit, in cents
    pub price: i64,

    /// Total units owned
    pub quantity: i32,

    pub status: InventoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// BOOKING AGGREGATE
// =============================================================================
/// An event reservation. Owns its line items; references at most one invoice
/// and one quote through nullable foreign keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub business_id: Uuid,
    pub customer_id: Option<Uuid>,

    /// Local calendar date of `start_time` in `timezone`
    pub event_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// IANA zone name the event takes place in
    pub timezone: String,

    pub event_address: String,
    pub event_city: String,
    pub event_state: String,
    pub event_zip: String,
    pub participant_count: i32,

    pub status: BookingStatus,

    pub subtotal_amount: i64,
    /// Tax rate in basis points (825 = 8.25%)
    pub tax_rate_bps: i32,
    pub tax_amount: i64,
    pub total_amount: i64,

    /// Set only while status is HOLD
    pub expires_at: Option<DateTime<Utc>>,

    pub coupon_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub quote_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// A HOLD whose expiry has passed no longer blocks capacity, whatever
    /// the status column says.
    pub fn is_expired_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Hold && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether this booking's live items count against inventory capacity.
    pub fn holds_capacity(&self, now: DateTime<Utc>) -> bool {
        self.status != BookingStatus::Cancelled && !self.is_expired_hold(now)
    }
}

/// One line item: `quantity` units of one inventory type over
/// `[start_utc, end_utc]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BookingItem {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub inventory_id: Uuid,
    pub quantity: i32,

    /// Unit price in cents, copied from the inventory at write time
    pub price: i64,

    #[serde(rename = "startUTC")]
    pub start_utc: DateTime<Utc>,
    #[serde(rename = "endUTC")]
    pub end_utc: DateTime<Utc>,

    /// Mirrors the parent booking; CANCELLED when the item alone was removed
    pub booking_status: BookingStatus,

    pub created_at: DateTime<Utc>,
}

impl BookingItem {
    pub fn is_active(&self) -> bool {
        self.booking_status != BookingStatus::Cancelled
    }

    pub fn line_total(&self) -> i64 {
        self.price * i64::from(self.quantity)
    }
}

// =============================================================================
// BILLING ARTIFACTS
// =============================================================================
/// Stripe invoice mirrored locally. Voided, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: Uuid,
    pub business_id: Uuid,
    pub booking_id: Uuid,
    pub stripe_invoice_id: String,
    pub status: InvoiceStatus,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stripe quote mirrored locally. Canceled, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: Uuid,
    pub business_id: Uuid,
    pub booking_id: Uuid,
    pub stripe_quote_id: String,
    pub status: QuoteStatus,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stripe payment intent recorded against a booking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub business_id: Uuid,
    pub booking_id: Uuid,
    pub stripe_payment_intent_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Signed liability waiver for an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Waiver {
    pub id: Uuid,
    pub business_id: Uuid,
    pub booking_id: Uuid,
    pub signer_name: String,
    pub signed_at: DateTime<Utc>,
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

/// One requested line item
///
/// # Example JSON
/// ```json
/// {
///   "inventoryId": "6f1c...",
///   "quantity": 1,
///   "startUTC": "2024-06-01T10:00:00Z",
///   "endUTC": "2024-06-01T14:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRequest {
    pub inventory_id: Uuid,
    pub quantity: i32,
    #[serde(rename = "startUTC")]
    pub start_utc: DateTime<Utc>,
    #[serde(rename = "endUTC")]
    pub end_utc: DateTime<Utc>,
}

/// Event details supplied when a booking is reserved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Required; requests without a zone are rejected
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub event_address: String,
    #[serde(default)]
    pub event_city: String,
    #[serde(default)]
    pub event_state: String,
    #[serde(default)]
    pub event_zip: String,
    #[serde(default)]
    pub participant_count: i32,
    #[serde(default)]
    pub tax_rate_bps: i32,
    #[serde(default)]
    pub coupon_id: Option<Uuid>,
}

/// `POST /api/v1/bookings/reserve`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub business_id: Uuid,
    pub items: Vec<ItemRequest>,
    pub event_details: EventDetails,
}

/// `POST /api/v1/availability`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRequest {
    pub business_id: Uuid,
    pub items: Vec<ItemRequest>,
}

/// Partial event details for an edit. When present, `timezone` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFieldsPatch {
    pub customer_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub event_address: Option<String>,
    pub event_city: Option<String>,
    pub event_state: Option<String>,
    pub event_zip: Option<String>,
    pub participant_count: Option<i32>,
    pub tax_rate_bps: Option<i32>,
    pub coupon_id: Option<Uuid>,
}

/// Change to an existing line item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub id: Uuid,
    pub quantity: Option<i32>,
    #[serde(rename = "startUTC")]
    pub start_utc: Option<DateTime<Utc>>,
    #[serde(rename = "endUTC")]
    pub end_utc: Option<DateTime<Utc>>,
}

/// `PATCH /api/v1/bookings/:booking_id`
///
/// Two mutually exclusive ways to change items:
/// - `replaceItems`: hard-delete every existing item and insert this set
/// - `removeItemIds` / `updateItems` / `addItems`: soft-cancel, modify and
///   append individual items
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBookingRequest {
    #[serde(default)]
    pub event_fields: Option<EventFieldsPatch>,
    #[serde(default)]
    pub add_items: Vec<ItemRequest>,
    #[serde(default)]
    pub remove_item_ids: Vec<Uuid>,
    #[serde(default)]
    pub update_items: Vec<ItemUpdate>,
    #[serde(default)]
    pub replace_items: Option<Vec<ItemRequest>>,
}

/// `POST /api/v1/bookings/:booking_id/confirm`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBookingRequest {
    pub stripe_payment_intent_id: String,
    pub amount: i64,
    pub payment_status: PaymentStatus,
}

/// `POST /api/v1/bookings/:booking_id/invoice`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachInvoiceRequest {
    pub stripe_invoice_id: String,
    pub status: InvoiceStatus,
    pub amount: i64,
}

/// `POST /api/v1/bookings/:booking_id/quote`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachQuoteRequest {
    pub stripe_quote_id: String,
    pub status: QuoteStatus,
    pub amount: i64,
}

/// `POST /api/v1/bookings/:booking_id/waivers`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignWaiverRequest {
    pub signer_name: String,
}

/// `?businessId=` scope for routes addressing a single booking
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessScope {
    pub business_id: Uuid,
}

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

/// Result of a successful reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub booking_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub available: bool,
}

/// A booking with everything it owns or references
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub items: Vec<BookingItem>,
    pub invoice: Option<Invoice>,
    pub quote: Option<Quote>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryListResponse {
    pub items: Vec<Inventory>,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Inventory item that ran out of capacity, for conflicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<Uuid>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            inventory_id: None,
        }
    }
}
