// =============================================================================
// TEST SUPPORT
// =============================================================================
// In-memory implementations of the booking core's seams, for unit tests.
//
// `MemoryStore` serializes transactions with one async mutex: `begin` takes
// the lock, works on a copy of the state, and `commit` writes the copy back.
// Dropping a transaction discards the copy, so rollback is free.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::availability::{CommittedItem, Period};
use crate::billing::BillingProvider;
use crate::bookings::BookingService;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{
    AttachInvoiceRequest, AttachQuoteRequest, Booking, BookingDetails, BookingItem, BookingStatus,
    EventDetails, EventFieldsPatch, Inventory, Invoice, InvoiceStatus, ItemRequest, Payment,
    Quote, QuoteStatus, ReserveRequest, ReserveResponse, UpdateBookingRequest, Waiver,
};
use crate::publisher::{ChangeEvent, ChangePublisher};
use crate::retry::RetryPolicy;
use crate::store::{BookingStore, BookingTx};

// =============================================================================
// MEMORY STORE
// =============================================================================
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub inventory: Vec<Inventory>,
    pub bookings: Vec<Booking>,
    pub items: Vec<BookingItem>,
    pub invoices: Vec<Invoice>,
    pub quotes: Vec<Quote>,
    pub payments: Vec<Payment>,
    pub waivers: Vec<Waiver>,
}

/// Decides whether a commit of the given working state fails.
type CommitFilter = Arc<dyn Fn(&MemoryState) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<tokio::sync::Mutex<MemoryState>>,
    fail_commits: Arc<AtomicUsize>,
    reject_commits: Arc<Mutex<Option<CommitFilter>>>,
    begun: Arc<AtomicUsize>,
    committed: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Make the next `n` commits fail with a serialization error.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail every commit whose resulting state matches `filter` with a
    /// serialization error, however often it is retried.
    pub fn reject_commits_where(&self, filter: impl Fn(&MemoryState) -> bool + Send + Sync + 'static) {
        *self.reject_commits.lock().unwrap() = Some(Arc::new(filter));
    }

    pub fn transactions_begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    pub async fn add_inventory(&self, inventory: Inventory) {
        self.state.lock().await.inventory.push(inventory);
    }

    pub async fn invoice_status(&self, id: Uuid) -> Option<InvoiceStatus> {
        let state = self.state.lock().await;
        state.invoices.iter().find(|i| i.id == id).map(|i| i.status)
    }

    pub async fn quote_status(&self, id: Uuid) -> Option<QuoteStatus> {
        let state = self.state.lock().await;
        state.quotes.iter().find(|q| q.id == id).map(|q| q.status)
    }

    pub async fn force_invoice_status(&self, id: Uuid, status: InvoiceStatus) {
        let mut state = self.state.lock().await;
        if let Some(invoice) = state.invoices.iter_mut().find(|i| i.id == id) {
            invoice.status = status;
        }
    }

    pub async fn booking(&self, id: Uuid) -> Option<Booking> {
        let state = self.state.lock().await;
        state.bookings.iter().find(|b| b.id == id).cloned()
    }

    pub async fn items(&self, booking_id: Uuid) -> Vec<BookingItem> {
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .filter(|i| i.booking_id == booking_id)
            .cloned()
            .collect()
    }

    async fn seed(&self, apply: impl FnOnce(&mut MemoryState)) {
        apply(&mut *self.state.lock().await);
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_commits: Arc<AtomicUsize>,
    reject: Option<CommitFilter>,
    committed: Arc<AtomicUsize>,
}

#[async_trait]
impl BookingStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> AppResult<MemoryTx> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();

        Ok(MemoryTx {
            guard,
            working,
            fail_commits: self.fail_commits.clone(),
            reject: self.reject_commits.lock().unwrap().clone(),
            committed: self.committed.clone(),
        })
    }
}

#[async_trait]
impl BookingTx for MemoryTx {
    async fn load_inventory(&mut self, business_id: Uuid, ids: &[Uuid]) -> AppResult<Vec<Inventory>> {
        Ok(self
            .working
            .inventory
            .iter()
            .filter(|inv| inv.business_id == business_id && ids.contains(&inv.id))
            .cloned()
            .collect())
    }

    async fn committed_items(
        &mut self,
        inventory_ids: &[Uuid],
        window: Period,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CommittedItem>> {
        let state = &self.working;
        Ok(state
            .items
            .iter()
            .filter(|item| item.is_active() && inventory_ids.contains(&item.inventory_id))
            .filter(|item| {
                state
                    .bookings
                    .iter()
                    .any(|b| b.id == item.booking_id && b.holds_capacity(now))
            })
            .map(|item| CommittedItem {
                inventory_id: item.inventory_id,
                quantity: item.quantity,
                period: Period {
                    start: item.start_utc,
                    end: item.end_utc,
                },
            })
            .filter(|c| c.period.overlaps(&window))
            .collect())
    }

    async fn find_booking(&mut self, business_id: Uuid, booking_id: Uuid) -> AppResult<Option<Booking>> {
        Ok(self
            .working
            .bookings
            .iter()
            .find(|b| b.id == booking_id && b.business_id == business_id)
            .cloned())
    }

    async fn find_booking_for_update(
        &mut self,
        business_id: Uuid,
        booking_id: Uuid,
    ) -> AppResult<Option<Booking>> {
        self.find_booking(business_id, booking_id).await
    }

    async fn expired_holds(&mut self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Booking>> {
        let mut expired: Vec<Booking> = self
            .working
            .bookings
            .iter()
            .filter(|b| b.is_expired_hold(now))
            .cloned()
            .collect();
        expired.sort_by_key(|b| b.expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired)
    }

    async fn insert_booking(&mut self, booking: &Booking) -> AppResult<()> {
        self.working.bookings.push(booking.clone());
        Ok(())
    }

    async fn update_booking(&mut self, booking: &Booking) -> AppResult<()> {
        let row = self
            .working
            .bookings
            .iter_mut()
            .find(|b| b.id == booking.id)
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking.id)))?;
        *row = booking.clone();
        Ok(())
    }

    async fn booking_items(&mut self, booking_id: Uuid) -> AppResult<Vec<BookingItem>> {
        Ok(self
            .working
            .items
            .iter()
            .filter(|i| i.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_items(&mut self, items: &[BookingItem]) -> AppResult<()> {
        self.working.items.extend_from_slice(items);
        Ok(())
    }

    async fn delete_items(&mut self, booking_id: Uuid, item_ids: &[Uuid]) -> AppResult<u64> {
        let before = self.working.items.len();
        self.working
            .items
            .retain(|i| !(i.booking_id == booking_id && item_ids.contains(&i.id)));
        Ok((before - self.working.items.len()) as u64)
    }

    async fn set_items_status(
        &mut self,
        booking_id: Uuid,
        item_ids: &[Uuid],
        status: BookingStatus,
    ) -> AppResult<u64> {
        let mut changed = 0;
        for item in self
            .working
            .items
            .iter_mut()
            .filter(|i| i.booking_id == booking_id && item_ids.contains(&i.id))
        {
            item.booking_status = status;
            changed += 1;
        }
        Ok(changed)
    }

    async fn invoice(&mut self, invoice_id: Uuid) -> AppResult<Option<Invoice>> {
        Ok(self.working.invoices.iter().find(|i| i.id == invoice_id).cloned())
    }

    async fn quote(&mut self, quote_id: Uuid) -> AppResult<Option<Quote>> {
        Ok(self.working.quotes.iter().find(|q| q.id == quote_id).cloned())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> AppResult<()> {
        self.working.invoices.push(invoice.clone());
        Ok(())
    }

    async fn insert_quote(&mut self, quote: &Quote) -> AppResult<()> {
        self.working.quotes.push(quote.clone());
        Ok(())
    }

    async fn set_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(invoice) = self.working.invoices.iter_mut().find(|i| i.id == invoice_id) {
            invoice.status = status;
            invoice.updated_at = now;
        }
        Ok(())
    }

    async fn set_quote_status(
        &mut self,
        quote_id: Uuid,
        status: QuoteStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(quote) = self.working.quotes.iter_mut().find(|q| q.id == quote_id) {
            quote.status = status;
            quote.updated_at = now;
        }
        Ok(())
    }

    async fn payments(&mut self, booking_id: Uuid) -> AppResult<Vec<Payment>> {
        Ok(self
            .working
            .payments
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> AppResult<()> {
        self.working.payments.push(payment.clone());
        Ok(())
    }

    async fn insert_waiver(&mut self, waiver: &Waiver) -> AppResult<()> {
        self.working.waivers.push(waiver.clone());
        Ok(())
    }

    async fn commit(mut self) -> AppResult<()> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let rejected = self.reject.as_ref().is_some_and(|filter| filter(&self.working));
        if injected || rejected {
            return Err(AppError::TransientConflict(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }

        *self.guard = std::mem::take(&mut self.working);
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// FAKE SEAMS
// =============================================================================

/// Records remote invalidations; can be told to fail.
#[derive(Default)]
pub struct FakeBilling {
    failures: AtomicUsize,
    voided: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    canceled: Mutex<Vec<String>>,
}

impl FakeBilling {
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn voided_invoices(&self) -> Vec<String> {
        self.voided.lock().unwrap().clone()
    }

    pub fn deleted_invoices(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn canceled_quotes(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn void_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        if self.should_fail() {
            return Err(AppError::DependencyFailure("stripe unavailable".to_string()));
        }
        self.voided.lock().unwrap().push(stripe_invoice_id.to_string());
        Ok(())
    }

    async fn delete_draft_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        if self.should_fail() {
            return Err(AppError::DependencyFailure("stripe unavailable".to_string()));
        }
        self.deleted.lock().unwrap().push(stripe_invoice_id.to_string());
        Ok(())
    }

    async fn cancel_quote(&self, stripe_quote_id: &str) -> AppResult<()> {
        if self.should_fail() {
            return Err(AppError::DependencyFailure("stripe unavailable".to_string()));
        }
        self.canceled.lock().unwrap().push(stripe_quote_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangePublisher for RecordingPublisher {
    async fn publish(&self, event: &ChangeEvent) -> AppResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// A booking service wired to in-memory seams, with one business.
pub struct Harness {
    pub store: MemoryStore,
    pub billing: Arc<FakeBilling>,
    pub publisher: Arc<RecordingPublisher>,
    pub clock: Arc<ManualClock>,
    pub service: BookingService<MemoryStore>,
    pub business_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        let store = MemoryStore::default();
        let billing = Arc::new(FakeBilling::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = Arc::new(ManualClock::new(fixtures::t0()));

        let service = BookingService::new(
            store.clone(),
            billing.clone(),
            publisher.clone(),
            clock.clone(),
            RetryPolicy::new(3, std::time::Duration::ZERO),
            Duration::minutes(30),
        );

        Self {
            store,
            billing,
            publisher,
            clock,
            service,
            business_id: Uuid::new_v4(),
        }
    }

    /// Register a bounce-castle type with `quantity` units.
    pub async fn castle(&self, quantity: i32) -> Inventory {
        let inventory = fixtures::castle(self.business_id, quantity);
        self.store.add_inventory(inventory.clone()).await;
        inventory
    }

    pub async fn reserve(
        &self,
        inventory: &Inventory,
        quantity: i32,
        from: u32,
        to: u32,
    ) -> AppResult<ReserveResponse> {
        self.reserve_items(vec![fixtures::item(inventory, quantity, from, to)])
            .await
    }

    /// Reserve `items` with an event window spanning all of them.
    pub async fn reserve_items(&self, items: Vec<ItemRequest>) -> AppResult<ReserveResponse> {
        let start = items.iter().map(|i| i.start_utc).min().unwrap_or_else(|| fixtures::at(10));
        let end = items.iter().map(|i| i.end_utc).max().unwrap_or_else(|| fixtures::at(14));

        self.service
            .reserve(&ReserveRequest {
                business_id: self.business_id,
                items,
                event_details: fixtures::event(start, end),
            })
            .await
    }

    /// Edit that moves a booking to `[from, to]` with one unit.
    pub fn move_to(&self, inventory: &Inventory, from: u32, to: u32) -> UpdateBookingRequest {
        UpdateBookingRequest {
            event_fields: Some(EventFieldsPatch {
                start_time: Some(fixtures::at(from)),
                end_time: Some(fixtures::at(to)),
                timezone: Some("America/Chicago".to_string()),
                ..Default::default()
            }),
            replace_items: Some(vec![fixtures::item(inventory, 1, from, to)]),
            ..Default::default()
        }
    }

    /// Attach an OPEN invoice and an OPEN quote to a booking.
    pub async fn attach_billing(&self, booking_id: Uuid) -> (Invoice, Quote) {
        let with_invoice = self
            .service
            .attach_invoice(self.business_id, booking_id, &fixtures::open_invoice("in_test_1"))
            .await
            .unwrap();
        let with_quote = self
            .service
            .attach_quote(self.business_id, booking_id, &fixtures::open_quote("qt_test_1"))
            .await
            .unwrap();

        (with_invoice.invoice.unwrap(), with_quote.quote.unwrap())
    }

    pub async fn details(&self, booking_id: Uuid) -> BookingDetails {
        self.service
            .get_booking(self.business_id, booking_id)
            .await
            .unwrap()
    }
}

// =============================================================================
// FIXTURES
// =============================================================================
pub mod fixtures {
    use super::*;

    /// 2024-06-01 08:00 UTC, the harness clock's starting point.
    pub fn t0() -> DateTime<Utc> {
        at(8)
    }

    /// 2024-06-01 at `hour`:00 UTC.
    pub fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    pub fn castle(business_id: Uuid, quantity: i32) -> Inventory {
        Inventory {
            id: Uuid::new_v4(),
            business_id,
            name: "Castle-A".to_string(),
            kind: "bounce_house".to_string(),
            price: 25_000,
            quantity,
            status: crate::models::InventoryStatus::Available,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    pub fn item(inventory: &Inventory, quantity: i32, from: u32, to: u32) -> ItemRequest {
        ItemRequest {
            inventory_id: inventory.id,
            quantity,
            start_utc: at(from),
            end_utc: at(to),
        }
    }

    pub fn event(start: DateTime<Utc>, end: DateTime<Utc>) -> EventDetails {
        EventDetails {
            customer_id: Some(Uuid::new_v4()),
            start_time: start,
            end_time: end,
            timezone: Some("America/Chicago".to_string()),
            event_address: "1 Main St".to_string(),
            event_city: "Austin".to_string(),
            event_state: "TX".to_string(),
            event_zip: "78701".to_string(),
            participant_count: 20,
            tax_rate_bps: 825,
            coupon_id: None,
        }
    }

    pub fn paid(amount: i64) -> crate::models::ConfirmBookingRequest {
        crate::models::ConfirmBookingRequest {
            stripe_payment_intent_id: "pi_test_1".to_string(),
            amount,
            payment_status: crate::models::PaymentStatus::Succeeded,
        }
    }

    pub fn open_invoice(stripe_id: &str) -> AttachInvoiceRequest {
        AttachInvoiceRequest {
            stripe_invoice_id: stripe_id.to_string(),
            status: InvoiceStatus::Open,
            amount: 27_063,
        }
    }

    pub fn open_quote(stripe_id: &str) -> AttachQuoteRequest {
        AttachQuoteRequest {
            stripe_quote_id: stripe_id.to_string(),
            status: QuoteStatus::Open,
            amount: 27_063,
        }
    }

    /// An unsaved HOLD booking on 2024-06-01, 10:00 to 14:00 UTC.
    pub fn hold_booking(business_id: Uuid) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            business_id,
            customer_id: None,
            event_date: at(10).date_naive(),
            start_time: at(10),
            end_time: at(14),
            timezone: "UTC".to_string(),
            event_address: String::new(),
            event_city: String::new(),
            event_state: String::new(),
            event_zip: String::new(),
            participant_count: 0,
            status: BookingStatus::Hold,
            subtotal_amount: 25_000,
            tax_rate_bps: 0,
            tax_amount: 0,
            total_amount: 25_000,
            expires_at: Some(t0() + Duration::minutes(30)),
            coupon_id: None,
            invoice_id: None,
            quote_id: None,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    /// Save a HOLD booking with an OPEN invoice and an OPEN quote.
    pub async fn booking_with_billing(store: &MemoryStore) -> (Booking, Invoice, Quote) {
        let mut booking = hold_booking(Uuid::new_v4());
        let invoice = Invoice {
            id: Uuid::new_v4(),
            business_id: booking.business_id,
            booking_id: booking.id,
            stripe_invoice_id: "in_fixture".to_string(),
            status: InvoiceStatus::Open,
            amount: booking.total_amount,
            created_at: t0(),
            updated_at: t0(),
        };
        let quote = Quote {
            id: Uuid::new_v4(),
            business_id: booking.business_id,
            booking_id: booking.id,
            stripe_quote_id: "qt_fixture".to_string(),
            status: QuoteStatus::Open,
            amount: booking.total_amount,
            created_at: t0(),
            updated_at: t0(),
        };
        booking.invoice_id = Some(invoice.id);
        booking.quote_id = Some(quote.id);

        let (b, i, q) = (booking.clone(), invoice.clone(), quote.clone());
        store
            .seed(move |state| {
                state.bookings.push(b);
                state.invoices.push(i);
                state.quotes.push(q);
            })
            .await;

        (booking, invoice, quote)
    }
}
