// =============================================================================
// STORE MODULE
// =============================================================================
// The data-access seam of the booking core. A `BookingStore` opens
// transactions; a `BookingTx` is one serializable transaction.
//
// Dropping a `BookingTx` without calling `commit` rolls it back. Errors that
// mean "a concurrent transaction won" surface as `AppError::TransientConflict`
// so the retry loop can tell them apart from permanent failures.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::availability::{CommittedItem, Period};
use crate::error::AppResult;
use crate::models::{
    Booking, BookingItem, BookingStatus, Inventory, Invoice, InvoiceStatus, Payment, Quote,
    QuoteStatus, Waiver,
};

#[async_trait]
pub trait BookingStore: Send + Sync {
    type Tx: BookingTx;

    /// Open a transaction at SERIALIZABLE isolation.
    async fn begin(&self) -> AppResult<Self::Tx>;
}

#[async_trait]
pub trait BookingTx: Send {
    // -------------------------------------------------------------------------
    // INVENTORY LEDGER
    // -------------------------------------------------------------------------
    /// Inventory rows of `business_id` among `ids`. Unknown ids are omitted.
    async fn load_inventory(&mut self, business_id: Uuid, ids: &[Uuid])
        -> AppResult<Vec<Inventory>>;

    /// Live line items of the given inventory types overlapping `window`.
    ///
    /// Excludes cancelled items, items of cancelled bookings, and items of
    /// HOLD bookings whose `expires_at <= now`.
    async fn committed_items(
        &mut self,
        inventory_ids: &[Uuid],
        window: Period,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CommittedItem>>;

    // -------------------------------------------------------------------------
    // BOOKINGS
    // -------------------------------------------------------------------------
    /// Read a booking scoped to its business.
    async fn find_booking(&mut self, business_id: Uuid, booking_id: Uuid)
        -> AppResult<Option<Booking>>;

    /// Read a booking and lock it against concurrent writers.
    async fn find_booking_for_update(
        &mut self,
        business_id: Uuid,
        booking_id: Uuid,
    ) -> AppResult<Option<Booking>>;

    /// HOLD bookings whose expiry is at or before `now`, oldest first.
    async fn expired_holds(&mut self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Booking>>;

    async fn insert_booking(&mut self, booking: &Booking) -> AppResult<()>;

    /// Persist every mutable column of `booking`.
    async fn update_booking(&mut self, booking: &Booking) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // LINE ITEMS
    // -------------------------------------------------------------------------
    /// All items of a booking, cancelled ones included, in creation order.
    async fn booking_items(&mut self, booking_id: Uuid) -> AppResult<Vec<BookingItem>>;

    async fn insert_items(&mut self, items: &[BookingItem]) -> AppResult<()>;

    /// Physically delete items. Returns the number of rows removed.
    async fn delete_items(&mut self, booking_id: Uuid, item_ids: &[Uuid]) -> AppResult<u64>;

    /// Set `booking_status` on items. Returns the number of rows changed.
    async fn set_items_status(
        &mut self,
        booking_id: Uuid,
        item_ids: &[Uuid],
        status: BookingStatus,
    ) -> AppResult<u64>;

    // -------------------------------------------------------------------------
    // BILLING ARTIFACTS
    // -------------------------------------------------------------------------
    async fn invoice(&mut self, invoice_id: Uuid) -> AppResult<Option<Invoice>>;

    async fn quote(&mut self, quote_id: Uuid) -> AppResult<Option<Quote>>;

    async fn insert_invoice(&mut self, invoice: &Invoice) -> AppResult<()>;

    async fn insert_quote(&mut self, quote: &Quote) -> AppResult<()>;

    async fn set_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn set_quote_status(
        &mut self,
        quote_id: Uuid,
        status: QuoteStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // PAYMENTS & WAIVERS
    // -------------------------------------------------------------------------
    async fn payments(&mut self, booking_id: Uuid) -> AppResult<Vec<Payment>>;

    async fn insert_payment(&mut self, payment: &Payment) -> AppResult<()>;

    async fn insert_waiver(&mut self, waiver: &Waiver) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // COMPLETION
    // -------------------------------------------------------------------------
    async fn commit(self) -> AppResult<()>;
}
