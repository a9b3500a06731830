// =============================================================================
// BOOKINGS MODULE
// =============================================================================
// The transactional update engine. Every write here is one serializable
// transaction run through `retry::run_with_retry`:
//
//   begin → re-read (locked) → validate status → mutate → re-check capacity
//         → reconcile billing → write → commit → publish
//
// A failure at any step drops the transaction, which rolls it back; nothing
// is published for rolled-back attempts. Reservation and hold expiry live in
// `holds.rs` on the same service type.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::availability::{self, Period};
use crate::billing::BillingProvider;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    AttachInvoiceRequest, AttachQuoteRequest, AvailabilityRequest, Booking, BookingDetails,
    BookingItem, BookingStatus, ConfirmBookingRequest, EventDetails, EventFieldsPatch, Inventory,
    Invoice, InvoiceStatus, ItemRequest, Payment, PaymentStatus, Quote, SignWaiverRequest,
    UpdateBookingRequest, Waiver,
};
use crate::publisher::{publish_committed, ChangeEvent, ChangePublisher};
use crate::reconcile::{mark_invalidated, reconcile, Reconciled, RemoteInvalidations};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{BookingStore, BookingTx};

/// Largest accepted tax rate, in basis points (100%)
const MAX_TAX_RATE_BPS: i32 = 10_000;

// =============================================================================
// SERVICE
// =============================================================================
#[derive(Clone)]
pub struct BookingService<S> {
    pub(crate) store: S,
    pub(crate) billing: Arc<dyn BillingProvider>,
    pub(crate) publisher: Arc<dyn ChangePublisher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: RetryPolicy,
    pub(crate) hold_ttl: Duration,
}

impl<S: BookingStore> BookingService<S> {
    pub fn new(
        store: S,
        billing: Arc<dyn BillingProvider>,
        publisher: Arc<dyn ChangePublisher>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        hold_ttl: Duration,
    ) -> Self {
        Self {
            store,
            billing,
            publisher,
            clock,
            policy,
            hold_ttl,
        }
    }

    pub(crate) async fn publish(&self, event: ChangeEvent) {
        publish_committed(self.publisher.as_ref(), event).await;
    }

    /// Called with the final result of an operation that may have
    /// invalidated billing artifacts remotely. When the operation failed
    /// after the provider accepted a void/cancel, the local rows are brought
    /// in line in a separate transaction; the booking's items stay as they
    /// were. The original result is returned either way.
    pub(crate) async fn settle_remote<T>(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        remote: &RemoteInvalidations,
        result: AppResult<T>,
    ) -> AppResult<T> {
        let invalidated = remote.snapshot();
        if result.is_ok() || invalidated.is_noop() {
            return result;
        }
        let failure = result.as_ref().err().map(ToString::to_string).unwrap_or_default();

        let synced = run_with_retry(&self.policy, "settle_remote", |_| {
            self.settle_remote_once(business_id, booking_id, &invalidated)
        })
        .await;

        match synced {
            Ok(changed) => {
                tracing::error!(
                    %booking_id,
                    voided_invoice = ?invalidated.voided_invoice,
                    canceled_quote = ?invalidated.canceled_quote,
                    error = %failure,
                    "Booking change failed after billing was invalidated remotely; local billing records updated to match, booking needs follow-up"
                );
                if let Some((previous, current)) = changed {
                    self.publish(ChangeEvent::booking_updated(&previous, &current))
                        .await;
                }
            }
            Err(sync_err) => {
                tracing::error!(
                    %booking_id,
                    voided_invoice = ?invalidated.voided_invoice,
                    canceled_quote = ?invalidated.canceled_quote,
                    error = %failure,
                    sync_error = %sync_err,
                    "Billing invalidated remotely but local records could not be updated; manual follow-up required"
                );
            }
        }

        result
    }

    async fn settle_remote_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        invalidated: &Reconciled,
    ) -> AppResult<Option<(Booking, Booking)>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let Some(mut booking) = tx.find_booking_for_update(business_id, booking_id).await? else {
            return Ok(None);
        };
        let previous = booking.clone();

        let changed = mark_invalidated(&mut tx, &mut booking, invalidated, now).await?;
        if changed {
            booking.updated_at = now;
            tx.update_booking(&booking).await?;
        }
        tx.commit().await?;

        Ok(changed.then_some((previous, booking)))
    }

    // -------------------------------------------------------------------------
    // READS
    // -------------------------------------------------------------------------
    /// Fetch a booking with its items, billing artifacts and payments.
    ///
    /// # Errors
    /// `NotFound` when the booking does not exist under `business_id`.
    pub async fn get_booking(&self, business_id: Uuid, booking_id: Uuid) -> AppResult<BookingDetails> {
        run_with_retry(&self.policy, "get_booking", |_| self.get_once(business_id, booking_id)).await
    }

    async fn get_once(&self, business_id: Uuid, booking_id: Uuid) -> AppResult<BookingDetails> {
        let mut tx = self.store.begin().await?;
        let booking = tx
            .find_booking(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;
        load_details(&mut tx, booking).await
    }

    /// Read-only availability check. Advisory: the write paths re-check
    /// inside their own transaction.
    pub async fn check_availability(&self, request: &AvailabilityRequest) -> AppResult<()> {
        availability::validate_items(&request.items)?;

        let result = run_with_retry(&self.policy, "check_availability", |_| {
            self.check_once(request)
        })
        .await;
        observe("check_availability", &result);
        result
    }

    async fn check_once(&self, request: &AvailabilityRequest) -> AppResult<()> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        verify_capacity(&mut tx, request.business_id, &request.items, now).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // EDIT
    // -------------------------------------------------------------------------
    /// Edit a HOLD or PENDING booking.
    ///
    /// Replaces the booking's line items per `request`, re-checks capacity
    /// for the resulting set, voids any active invoice and cancels any
    /// active quote, recomputes amounts and re-opens the hold with a fresh
    /// expiry.
    ///
    /// # Errors
    /// - `InvalidInput` for malformed patches
    /// - `NotFound` for unknown bookings
    /// - `InvalidState` when the booking is not editable or already paid
    /// - `Conflict` when the new items no longer fit, or retries ran out
    /// - `DependencyFailure` when billing could not be reconciled
    pub async fn update_booking(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &UpdateBookingRequest,
    ) -> AppResult<BookingDetails> {
        tracing::info!(%business_id, %booking_id, "Updating booking");
        validate_update(request)?;

        let remote = RemoteInvalidations::default();
        let result = run_with_retry(&self.policy, "update_booking", |_| {
            self.update_once(business_id, booking_id, request, &remote)
        })
        .await;
        let result = self.settle_remote(business_id, booking_id, &remote, result).await;
        observe("update_booking", &result);

        let (details, previous) = result?;
        self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
            .await;
        Ok(details)
    }

    async fn update_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &UpdateBookingRequest,
        remote: &RemoteInvalidations,
    ) -> AppResult<(BookingDetails, Booking)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        // Latest state under lock; a racing cancel shows up here.
        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if !booking.status.is_editable() {
            return Err(not_editable(&booking));
        }
        if let Some(invoice_id) = booking.invoice_id {
            if let Some(invoice) = tx.invoice(invoice_id).await? {
                if invoice.status == InvoiceStatus::Paid {
                    return Err(AppError::InvalidState(
                        "booking has already been paid and can no longer be changed".to_string(),
                    ));
                }
            }
        }

        let previous = booking.clone();
        let current = tx.booking_items(booking.id).await?;
        let plan = plan_item_changes(&current, request)?;

        if let Some(fields) = &request.event_fields {
            apply_event_fields(&mut booking, fields)?;
        }

        let requests: Vec<ItemRequest> = plan.next.iter().map(ItemDraft::as_request).collect();
        ensure_within_event(&requests, booking.start_time, booking.end_time)?;

        // Superseded items go first so they do not count against the new set.
        if !plan.soft_cancel.is_empty() {
            tx.set_items_status(booking.id, &plan.soft_cancel, BookingStatus::Cancelled)
                .await?;
        }
        if !plan.hard_delete.is_empty() {
            tx.delete_items(booking.id, &plan.hard_delete).await?;
        }

        let inventory = verify_capacity(&mut tx, business_id, &requests, now).await?;

        // Remote voiding only after capacity is known to fit.
        let reconciled = reconcile(&mut tx, self.billing.as_ref(), remote, &mut booking, now).await?;
        if !reconciled.is_noop() {
            tracing::debug!(
                %booking_id,
                voided_invoice = ?reconciled.voided_invoice,
                canceled_quote = ?reconciled.canceled_quote,
                "Billing artifacts invalidated by edit"
            );
        }

        let items = build_items(booking.id, &plan.next, &inventory, BookingStatus::Hold, now)?;
        tx.insert_items(&items).await?;

        compute_totals(&items, booking.tax_rate_bps).apply(&mut booking);
        booking.status = BookingStatus::Hold;
        booking.expires_at = Some(now + self.hold_ttl);
        booking.updated_at = now;
        tx.update_booking(&booking).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;

        tracing::info!(
            booking_id = %booking_id,
            items = details.items.len(),
            total = details.booking.total_amount,
            "Booking updated"
        );
        Ok((details, previous))
    }

    // -------------------------------------------------------------------------
    // CANCEL
    // -------------------------------------------------------------------------
    /// Cancel a booking: soft-cancel its items and invalidate its active
    /// invoice/quote. Cancelling a cancelled booking returns it unchanged.
    pub async fn cancel_booking(&self, business_id: Uuid, booking_id: Uuid) -> AppResult<BookingDetails> {
        tracing::info!(%business_id, %booking_id, "Cancelling booking");

        let remote = RemoteInvalidations::default();
        let result = run_with_retry(&self.policy, "cancel_booking", |_| {
            self.cancel_once(business_id, booking_id, &remote)
        })
        .await;
        let result = self.settle_remote(business_id, booking_id, &remote, result).await;
        observe("cancel_booking", &result);

        let (details, previous) = result?;
        if let Some(previous) = previous {
            self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
                .await;
        }
        Ok(details)
    }

    async fn cancel_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        remote: &RemoteInvalidations,
    ) -> AppResult<(BookingDetails, Option<Booking>)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if booking.status == BookingStatus::Cancelled {
            return Ok((load_details(&mut tx, booking).await?, None));
        }
        if !booking.status.is_cancellable() {
            return Err(AppError::InvalidState(format!(
                "a {} booking cannot be cancelled",
                booking.status.as_str()
            )));
        }

        let previous = booking.clone();
        release_booking(&mut tx, self.billing.as_ref(), remote, &mut booking, now).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;
        Ok((details, Some(previous)))
    }

    // -------------------------------------------------------------------------
    // CONFIRM / COMPLETE
    // -------------------------------------------------------------------------
    /// Record a payment and move a HOLD booking to CONFIRMED (payment
    /// succeeded) or PENDING (payment still processing). A PENDING booking
    /// becomes CONFIRMED once its payment succeeds.
    ///
    /// A hold that expired before payment arrived has stopped blocking
    /// capacity, so its items are re-checked first.
    pub async fn confirm_booking(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &ConfirmBookingRequest,
    ) -> AppResult<BookingDetails> {
        tracing::info!(%business_id, %booking_id, status = ?request.payment_status, "Confirming booking");
        validate_confirmation(request)?;

        let result = run_with_retry(&self.policy, "confirm_booking", |_| {
            self.confirm_once(business_id, booking_id, request)
        })
        .await;
        observe("confirm_booking", &result);

        let (details, previous) = result?;
        self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
            .await;
        Ok(details)
    }

    async fn confirm_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &ConfirmBookingRequest,
    ) -> AppResult<(BookingDetails, Booking)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        let next_status = match (booking.status, request.payment_status) {
            (BookingStatus::Hold, PaymentStatus::Succeeded) => BookingStatus::Confirmed,
            (BookingStatus::Hold, PaymentStatus::Pending) => BookingStatus::Pending,
            (BookingStatus::Pending, PaymentStatus::Succeeded) => BookingStatus::Confirmed,
            (status, _) => {
                return Err(AppError::InvalidState(format!(
                    "a {} booking cannot be confirmed",
                    status.as_str()
                )))
            }
        };

        let active: Vec<BookingItem> = tx
            .booking_items(booking.id)
            .await?
            .into_iter()
            .filter(BookingItem::is_active)
            .collect();

        // An expired hold stopped counting; someone may have taken its slot.
        if !booking.holds_capacity(now) {
            let requests: Vec<ItemRequest> = active.iter().map(item_request).collect();
            verify_capacity(&mut tx, business_id, &requests, now)
                .await
                .map_err(|err| match err {
                    AppError::Conflict { inventory_id, reason } => AppError::Conflict {
                        inventory_id,
                        reason: format!("the hold expired and the slot was taken: {reason}"),
                    },
                    other => other,
                })?;
        }

        let previous = booking.clone();

        tx.insert_payment(&Payment {
            id: Uuid::new_v4(),
            business_id,
            booking_id,
            stripe_payment_intent_id: request.stripe_payment_intent_id.clone(),
            amount: request.amount,
            status: request.payment_status,
            created_at: now,
        })
        .await?;

        let active_ids: Vec<Uuid> = active.iter().map(|item| item.id).collect();
        tx.set_items_status(booking.id, &active_ids, next_status).await?;

        booking.status = next_status;
        booking.expires_at = None;
        booking.updated_at = now;
        tx.update_booking(&booking).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;
        Ok((details, previous))
    }

    /// Mark a PENDING or CONFIRMED booking as fulfilled.
    pub async fn complete_booking(&self, business_id: Uuid, booking_id: Uuid) -> AppResult<BookingDetails> {
        let result = run_with_retry(&self.policy, "complete_booking", |_| {
            self.complete_once(business_id, booking_id)
        })
        .await;
        observe("complete_booking", &result);

        let (details, previous) = result?;
        self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
            .await;
        Ok(details)
    }

    async fn complete_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
    ) -> AppResult<(BookingDetails, Booking)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(AppError::InvalidState(format!(
                "a {} booking cannot be completed",
                booking.status.as_str()
            )));
        }

        let previous = booking.clone();
        let active_ids: Vec<Uuid> = tx
            .booking_items(booking.id)
            .await?
            .iter()
            .filter(|item| item.is_active())
            .map(|item| item.id)
            .collect();
        tx.set_items_status(booking.id, &active_ids, BookingStatus::Completed)
            .await?;

        booking.status = BookingStatus::Completed;
        booking.updated_at = now;
        tx.update_booking(&booking).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;
        Ok((details, previous))
    }

    // -------------------------------------------------------------------------
    // BILLING ARTIFACTS
    // -------------------------------------------------------------------------
    /// Attach a freshly created invoice. At most one active invoice may be
    /// attached at a time.
    pub async fn attach_invoice(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &AttachInvoiceRequest,
    ) -> AppResult<BookingDetails> {
        if request.stripe_invoice_id.trim().is_empty() {
            return Err(AppError::InvalidInput("stripeInvoiceId is required".to_string()));
        }
        if !request.status.is_active() {
            return Err(AppError::InvalidInput(
                "only DRAFT or OPEN invoices can be attached".to_string(),
            ));
        }

        let (details, previous) = run_with_retry(&self.policy, "attach_invoice", |_| {
            self.attach_invoice_once(business_id, booking_id, request)
        })
        .await?;

        self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
            .await;
        Ok(details)
    }

    async fn attach_invoice_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &AttachInvoiceRequest,
    ) -> AppResult<(BookingDetails, Booking)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if !booking.status.is_editable() {
            return Err(not_editable(&booking));
        }
        if let Some(existing) = booking.invoice_id {
            if let Some(invoice) = tx.invoice(existing).await? {
                if invoice.status != InvoiceStatus::Void {
                    return Err(AppError::InvalidState(
                        "booking already has an active invoice".to_string(),
                    ));
                }
            }
        }

        let previous = booking.clone();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            business_id,
            booking_id,
            stripe_invoice_id: request.stripe_invoice_id.clone(),
            status: request.status,
            amount: request.amount,
            created_at: now,
            updated_at: now,
        };
        tx.insert_invoice(&invoice).await?;

        booking.invoice_id = Some(invoice.id);
        booking.updated_at = now;
        tx.update_booking(&booking).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;
        Ok((details, previous))
    }

    /// Attach a freshly created quote. At most one active quote may be
    /// attached at a time.
    pub async fn attach_quote(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &AttachQuoteRequest,
    ) -> AppResult<BookingDetails> {
        if request.stripe_quote_id.trim().is_empty() {
            return Err(AppError::InvalidInput("stripeQuoteId is required".to_string()));
        }
        if !request.status.is_active() {
            return Err(AppError::InvalidInput(
                "only DRAFT or OPEN quotes can be attached".to_string(),
            ));
        }

        let (details, previous) = run_with_retry(&self.policy, "attach_quote", |_| {
            self.attach_quote_once(business_id, booking_id, request)
        })
        .await?;

        self.publish(ChangeEvent::booking_updated(&previous, &details.booking))
            .await;
        Ok(details)
    }

    async fn attach_quote_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &AttachQuoteRequest,
    ) -> AppResult<(BookingDetails, Booking)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = tx
            .find_booking_for_update(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if !booking.status.is_editable() {
            return Err(not_editable(&booking));
        }
        if let Some(existing) = booking.quote_id {
            if let Some(quote) = tx.quote(existing).await? {
                if quote.status.is_active() {
                    return Err(AppError::InvalidState(
                        "booking already has an active quote".to_string(),
                    ));
                }
            }
        }

        let previous = booking.clone();
        let quote = Quote {
            id: Uuid::new_v4(),
            business_id,
            booking_id,
            stripe_quote_id: request.stripe_quote_id.clone(),
            status: request.status,
            amount: request.amount,
            created_at: now,
            updated_at: now,
        };
        tx.insert_quote(&quote).await?;

        booking.quote_id = Some(quote.id);
        booking.updated_at = now;
        tx.update_booking(&booking).await?;

        let details = load_details(&mut tx, booking).await?;
        tx.commit().await?;
        Ok((details, previous))
    }

    // -------------------------------------------------------------------------
    // WAIVERS
    // -------------------------------------------------------------------------
    pub async fn sign_waiver(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        request: &SignWaiverRequest,
    ) -> AppResult<Waiver> {
        let signer_name = request.signer_name.trim();
        if signer_name.is_empty() {
            return Err(AppError::InvalidInput("signerName is required".to_string()));
        }

        let waiver = run_with_retry(&self.policy, "sign_waiver", |_| {
            self.sign_waiver_once(business_id, booking_id, signer_name)
        })
        .await?;

        self.publish(ChangeEvent::waiver_signed(&waiver)).await;
        Ok(waiver)
    }

    async fn sign_waiver_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        signer_name: &str,
    ) -> AppResult<Waiver> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let booking = tx
            .find_booking(business_id, booking_id)
            .await?
            .ok_or_else(|| not_found(booking_id))?;

        if booking.status == BookingStatus::Cancelled {
            return Err(AppError::InvalidState(
                "waivers cannot be signed for a cancelled booking".to_string(),
            ));
        }

        let waiver = Waiver {
            id: Uuid::new_v4(),
            business_id,
            booking_id,
            signer_name: signer_name.to_string(),
            signed_at: now,
        };
        tx.insert_waiver(&waiver).await?;
        tx.commit().await?;
        Ok(waiver)
    }
}

// =============================================================================
// TRANSACTION HELPERS
// =============================================================================

/// Load inventory and committed items for `items` and run the conflict
/// check. Returns the inventory ledger keyed by id for pricing.
pub(crate) async fn verify_capacity<T: BookingTx>(
    tx: &mut T,
    business_id: Uuid,
    items: &[ItemRequest],
    now: DateTime<Utc>,
) -> AppResult<HashMap<Uuid, Inventory>> {
    let window = availability::request_window(items)?;
    let ids: Vec<Uuid> = items
        .iter()
        .map(|item| item.inventory_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let inventory: HashMap<Uuid, Inventory> = tx
        .load_inventory(business_id, &ids)
        .await?
        .into_iter()
        .map(|inv| (inv.id, inv))
        .collect();

    let committed = tx.committed_items(&ids, window, now).await?;

    if let Err(err) = availability::check(items, &inventory, &committed) {
        if let AppError::Conflict { inventory_id, reason } = &err {
            metrics::record_availability_conflict(inventory_id.as_ref());
            tracing::warn!(%business_id, inventory_id = ?inventory_id, reason = %reason, "Availability conflict");
        }
        return Err(err);
    }

    Ok(inventory)
}

/// Cancel a booking inside `tx`: invalidate billing artifacts, soft-cancel
/// every live item and clear the hold expiry.
pub(crate) async fn release_booking<T: BookingTx>(
    tx: &mut T,
    billing: &dyn BillingProvider,
    remote: &RemoteInvalidations,
    booking: &mut Booking,
    now: DateTime<Utc>,
) -> AppResult<()> {
    reconcile(tx, billing, remote, booking, now).await?;

    let live: Vec<Uuid> = tx
        .booking_items(booking.id)
        .await?
        .iter()
        .filter(|item| item.is_active())
        .map(|item| item.id)
        .collect();
    if !live.is_empty() {
        tx.set_items_status(booking.id, &live, BookingStatus::Cancelled)
            .await?;
    }

    booking.status = BookingStatus::Cancelled;
    booking.expires_at = None;
    booking.updated_at = now;
    tx.update_booking(booking).await
}

pub(crate) async fn load_details<T: BookingTx>(tx: &mut T, booking: Booking) -> AppResult<BookingDetails> {
    let items = tx.booking_items(booking.id).await?;
    let invoice = match booking.invoice_id {
        Some(id) => tx.invoice(id).await?,
        None => None,
    };
    let quote = match booking.quote_id {
        Some(id) => tx.quote(id).await?,
        None => None,
    };
    let payments = tx.payments(booking.id).await?;

    Ok(BookingDetails {
        booking,
        items,
        invoice,
        quote,
        payments,
    })
}

/// Turn drafts into rows priced from the inventory ledger.
pub(crate) fn build_items(
    booking_id: Uuid,
    drafts: &[ItemDraft],
    inventory: &HashMap<Uuid, Inventory>,
    status: BookingStatus,
    now: DateTime<Utc>,
) -> AppResult<Vec<BookingItem>> {
    drafts
        .iter()
        .map(|draft| {
            let ledger = inventory.get(&draft.inventory_id).ok_or_else(|| {
                AppError::InvalidInput(format!("unknown inventory item {}", draft.inventory_id))
            })?;
            Ok(BookingItem {
                id: draft.id,
                booking_id,
                inventory_id: draft.inventory_id,
                quantity: draft.quantity,
                price: ledger.price,
                start_utc: draft.start_utc,
                end_utc: draft.end_utc,
                booking_status: status,
                created_at: now,
            })
        })
        .collect()
}

fn not_found(booking_id: Uuid) -> AppError {
    AppError::NotFound(format!("booking {booking_id} not found"))
}

fn not_editable(booking: &Booking) -> AppError {
    AppError::InvalidState(format!(
        "booking cannot be edited in its current state ({})",
        booking.status.as_str()
    ))
}

fn item_request(item: &BookingItem) -> ItemRequest {
    ItemRequest {
        inventory_id: item.inventory_id,
        quantity: item.quantity,
        start_utc: item.start_utc,
        end_utc: item.end_utc,
    }
}

/// Count an operation outcome by error code.
pub(crate) fn observe<T>(operation: &str, result: &AppResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.code(),
    };
    metrics::record_booking_operation(operation, outcome);
}

// =============================================================================
// PRICING
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: i64,
    pub tax: i64,
    pub total: i64,
}

impl Totals {
    pub fn apply(self, booking: &mut Booking) {
        booking.subtotal_amount = self.subtotal;
        booking.tax_amount = self.tax;
        booking.total_amount = self.total;
    }
}

/// Sum live items; tax is `subtotal × bps / 10 000`, rounded half up.
pub fn compute_totals(items: &[BookingItem], tax_rate_bps: i32) -> Totals {
    let subtotal: i64 = items
        .iter()
        .filter(|item| item.is_active())
        .map(BookingItem::line_total)
        .sum();
    let tax = (subtotal * i64::from(tax_rate_bps) + 5_000) / 10_000;

    Totals {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

// =============================================================================
// EVENT DETAILS
// =============================================================================

/// Parse a required IANA timezone name.
pub fn parse_timezone(name: Option<&str>) -> AppResult<Tz> {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::InvalidInput("timezone is required".to_string()))?;

    name.parse::<Tz>()
        .map_err(|_| AppError::InvalidInput(format!("unknown timezone {name}")))
}

/// Validate reservation event details and return the event's zone.
pub fn validate_event_details(details: &EventDetails) -> AppResult<Tz> {
    let tz = parse_timezone(details.timezone.as_deref())?;
    Period::new(details.start_time, details.end_time)?;
    validate_counts(details.participant_count, details.tax_rate_bps)?;
    Ok(tz)
}

fn validate_counts(participant_count: i32, tax_rate_bps: i32) -> AppResult<()> {
    if participant_count < 0 {
        return Err(AppError::InvalidInput(
            "participantCount cannot be negative".to_string(),
        ));
    }
    if !(0..=MAX_TAX_RATE_BPS).contains(&tax_rate_bps) {
        return Err(AppError::InvalidInput(format!(
            "taxRateBps must be between 0 and {MAX_TAX_RATE_BPS}"
        )));
    }
    Ok(())
}

/// Apply an event-field patch. The patch must name the event's timezone.
pub fn apply_event_fields(booking: &mut Booking, fields: &EventFieldsPatch) -> AppResult<()> {
    let tz = parse_timezone(fields.timezone.as_deref())?;

    let start = fields.start_time.unwrap_or(booking.start_time);
    let end = fields.end_time.unwrap_or(booking.end_time);
    Period::new(start, end)?;

    let participant_count = fields.participant_count.unwrap_or(booking.participant_count);
    let tax_rate_bps = fields.tax_rate_bps.unwrap_or(booking.tax_rate_bps);
    validate_counts(participant_count, tax_rate_bps)?;

    booking.start_time = start;
    booking.end_time = end;
    booking.timezone = tz.name().to_string();
    booking.event_date = start.with_timezone(&tz).date_naive();
    booking.participant_count = participant_count;
    booking.tax_rate_bps = tax_rate_bps;

    if let Some(customer_id) = fields.customer_id {
        booking.customer_id = Some(customer_id);
    }
    if let Some(coupon_id) = fields.coupon_id {
        booking.coupon_id = Some(coupon_id);
    }
    if let Some(address) = &fields.event_address {
        booking.event_address = address.clone();
    }
    if let Some(city) = &fields.event_city {
        booking.event_city = city.clone();
    }
    if let Some(state) = &fields.event_state {
        booking.event_state = state.clone();
    }
    if let Some(zip) = &fields.event_zip {
        booking.event_zip = zip.clone();
    }

    Ok(())
}

/// Every item must sit inside the event window.
pub fn ensure_within_event(
    items: &[ItemRequest],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AppResult<()> {
    let event = Period::new(start, end)?;
    for item in items {
        let period = Period::new(item.start_utc, item.end_utc)?;
        if !event.contains(&period) {
            return Err(AppError::InvalidInput(format!(
                "item for inventory {} ({} .. {}) falls outside the event window ({} .. {})",
                item.inventory_id, period.start, period.end, event.start, event.end
            )));
        }
    }
    Ok(())
}

fn validate_confirmation(request: &ConfirmBookingRequest) -> AppResult<()> {
    if request.stripe_payment_intent_id.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "stripePaymentIntentId is required".to_string(),
        ));
    }
    if request.amount <= 0 {
        return Err(AppError::InvalidInput("amount must be positive".to_string()));
    }
    if !matches!(
        request.payment_status,
        PaymentStatus::Succeeded | PaymentStatus::Pending
    ) {
        return Err(AppError::InvalidInput(
            "only SUCCEEDED or PENDING payments confirm a booking".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// ITEM CHANGE PLANNING
// =============================================================================

/// A line item about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDraft {
    pub id: Uuid,
    pub inventory_id: Uuid,
    pub quantity: i32,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl ItemDraft {
    pub fn fresh(request: &ItemRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            inventory_id: request.inventory_id,
            quantity: request.quantity,
            start_utc: request.start_utc,
            end_utc: request.end_utc,
        }
    }

    fn retained(item: &BookingItem) -> Self {
        Self {
            id: item.id,
            inventory_id: item.inventory_id,
            quantity: item.quantity,
            start_utc: item.start_utc,
            end_utc: item.end_utc,
        }
    }

    pub fn as_request(&self) -> ItemRequest {
        ItemRequest {
            inventory_id: self.inventory_id,
            quantity: self.quantity,
            start_utc: self.start_utc,
            end_utc: self.end_utc,
        }
    }
}

/// How an edit rewrites a booking's items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPlan {
    /// Rows to physically delete before re-inserting `next`
    pub hard_delete: Vec<Uuid>,
    /// Rows kept for audit with status CANCELLED
    pub soft_cancel: Vec<Uuid>,
    /// The booking's live item set after the edit
    pub next: Vec<ItemDraft>,
}

/// Shape checks that need no database access.
fn validate_update(request: &UpdateBookingRequest) -> AppResult<()> {
    let partial = !request.add_items.is_empty()
        || !request.remove_item_ids.is_empty()
        || !request.update_items.is_empty();

    if let Some(replacement) = &request.replace_items {
        if partial {
            return Err(AppError::InvalidInput(
                "replaceItems cannot be combined with addItems, removeItemIds or updateItems"
                    .to_string(),
            ));
        }
        availability::validate_items(replacement)?;
    }
    if !request.add_items.is_empty() {
        availability::validate_items(&request.add_items)?;
    }
    for update in &request.update_items {
        if update.quantity.is_some_and(|q| q <= 0) {
            return Err(AppError::InvalidInput(format!(
                "quantity for item {} must be positive",
                update.id
            )));
        }
    }
    Ok(())
}

/// Work out which rows to delete, which to soft-cancel, and the resulting
/// live set.
///
/// - `replaceItems`: every existing row is deleted, the replacement is the
///   new set.
/// - otherwise: `removeItemIds` are soft-cancelled; the other live items are
///   deleted and re-inserted with `updateItems` applied (keeping their ids);
///   `addItems` are appended.
pub fn plan_item_changes(current: &[BookingItem], request: &UpdateBookingRequest) -> AppResult<ItemPlan> {
    let plan = match &request.replace_items {
        Some(replacement) => ItemPlan {
            hard_delete: current.iter().map(|item| item.id).collect(),
            soft_cancel: Vec::new(),
            next: replacement.iter().map(ItemDraft::fresh).collect(),
        },
        None => {
            let live: HashMap<Uuid, &BookingItem> = current
                .iter()
                .filter(|item| item.is_active())
                .map(|item| (item.id, item))
                .collect();

            let removed: HashSet<Uuid> = request.remove_item_ids.iter().copied().collect();
            for id in &removed {
                if !live.contains_key(id) {
                    return Err(AppError::InvalidInput(format!("item {id} is not part of this booking")));
                }
            }

            let mut updates = HashMap::new();
            for update in &request.update_items {
                if !live.contains_key(&update.id) || removed.contains(&update.id) {
                    return Err(AppError::InvalidInput(format!(
                        "item {} cannot be updated",
                        update.id
                    )));
                }
                updates.insert(update.id, update);
            }

            let mut plan = ItemPlan::default();
            // Preserve creation order of the surviving items.
            for item in current.iter().filter(|item| item.is_active()) {
                if removed.contains(&item.id) {
                    plan.soft_cancel.push(item.id);
                    continue;
                }
                let mut draft = ItemDraft::retained(item);
                if let Some(update) = updates.get(&item.id) {
                    draft.quantity = update.quantity.unwrap_or(draft.quantity);
                    draft.start_utc = update.start_utc.unwrap_or(draft.start_utc);
                    draft.end_utc = update.end_utc.unwrap_or(draft.end_utc);
                }
                plan.hard_delete.push(item.id);
                plan.next.push(draft);
            }
            plan.next.extend(request.add_items.iter().map(ItemDraft::fresh));
            plan
        }
    };

    if plan.next.is_empty() {
        return Err(AppError::InvalidInput(
            "a booking must keep at least one item; cancel it instead".to_string(),
        ));
    }
    for draft in &plan.next {
        Period::new(draft.start_utc, draft.end_utc)?;
    }

    Ok(plan)
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemUpdate, QuoteStatus};
    use crate::testing::{fixtures, fixtures::at, Harness};

    // -------------------------------------------------------------------------
    // Pure helpers
    // -------------------------------------------------------------------------

    fn live_item(booking_id: Uuid, inventory_id: Uuid, from: u32, to: u32) -> BookingItem {
        BookingItem {
            id: Uuid::new_v4(),
            booking_id,
            inventory_id,
            quantity: 1,
            price: 10_000,
            start_utc: at(from),
            end_utc: at(to),
            booking_status: BookingStatus::Hold,
            created_at: at(0),
        }
    }

    #[test]
    fn totals_round_tax_half_up_and_skip_cancelled_items() {
        let booking_id = Uuid::new_v4();
        let mut items = vec![
            live_item(booking_id, Uuid::new_v4(), 10, 14),
            live_item(booking_id, Uuid::new_v4(), 10, 14),
        ];
        items[0].price = 12_345;
        items[1].booking_status = BookingStatus::Cancelled;

        let totals = compute_totals(&items, 825);
        assert_eq!(totals.subtotal, 12_345);
        assert_eq!(totals.tax, 1_018); // 1018.46
        assert_eq!(totals.total, 13_363);
    }

    #[test]
    fn missing_or_unknown_timezone_is_rejected() {
        assert!(matches!(parse_timezone(None), Err(AppError::InvalidInput(_))));
        assert!(matches!(parse_timezone(Some("  ")), Err(AppError::InvalidInput(_))));
        assert!(matches!(parse_timezone(Some("Mars/Olympus")), Err(AppError::InvalidInput(_))));
        assert_eq!(parse_timezone(Some("America/Chicago")).unwrap(), chrono_tz::America::Chicago);
    }

    #[test]
    fn event_date_follows_the_event_timezone() {
        let mut booking = fixtures::hold_booking(Uuid::new_v4());
        let patch = EventFieldsPatch {
            start_time: Some(at(2)),
            end_time: Some(at(6)),
            timezone: Some("America/Los_Angeles".to_string()),
            ..Default::default()
        };

        apply_event_fields(&mut booking, &patch).unwrap();

        // 02:00Z on June 1st is still May 31st in Los Angeles.
        assert_eq!(booking.event_date.to_string(), "2024-05-31");
        assert_eq!(booking.timezone, "America/Los_Angeles");
    }

    #[test]
    fn items_outside_the_event_window_are_rejected() {
        let inventory_id = Uuid::new_v4();
        let inside = ItemRequest { inventory_id, quantity: 1, start_utc: at(10), end_utc: at(14) };
        let outside = ItemRequest { inventory_id, quantity: 1, start_utc: at(9), end_utc: at(14) };

        ensure_within_event(&[inside], at(10), at(14)).unwrap();
        assert!(matches!(
            ensure_within_event(&[outside], at(10), at(14)),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn partial_plan_soft_cancels_removed_and_keeps_ids() {
        let booking_id = Uuid::new_v4();
        let a = live_item(booking_id, Uuid::new_v4(), 10, 14);
        let b = live_item(booking_id, Uuid::new_v4(), 10, 14);
        let request = UpdateBookingRequest {
            remove_item_ids: vec![a.id],
            update_items: vec![ItemUpdate {
                id: b.id,
                quantity: Some(2),
                start_utc: None,
                end_utc: Some(at(13)),
            }],
            ..Default::default()
        };

        let plan = plan_item_changes(&[a.clone(), b.clone()], &request).unwrap();

        assert_eq!(plan.soft_cancel, vec![a.id]);
        assert_eq!(plan.hard_delete, vec![b.id]);
        assert_eq!(plan.next.len(), 1);
        assert_eq!(plan.next[0].id, b.id);
        assert_eq!(plan.next[0].quantity, 2);
        assert_eq!(plan.next[0].end_utc, at(13));
    }

    #[test]
    fn replace_plan_hard_deletes_everything() {
        let booking_id = Uuid::new_v4();
        let mut cancelled = live_item(booking_id, Uuid::new_v4(), 10, 14);
        cancelled.booking_status = BookingStatus::Cancelled;
        let live = live_item(booking_id, Uuid::new_v4(), 10, 14);
        let replacement = ItemRequest {
            inventory_id: live.inventory_id,
            quantity: 1,
            start_utc: at(15),
            end_utc: at(18),
        };
        let request = UpdateBookingRequest {
            replace_items: Some(vec![replacement]),
            ..Default::default()
        };

        let plan = plan_item_changes(&[cancelled.clone(), live.clone()], &request).unwrap();

        assert_eq!(plan.hard_delete, vec![cancelled.id, live.id]);
        assert!(plan.soft_cancel.is_empty());
        assert_eq!(plan.next.len(), 1);
        assert_ne!(plan.next[0].id, live.id);
    }

    #[test]
    fn removing_every_item_is_invalid() {
        let booking_id = Uuid::new_v4();
        let a = live_item(booking_id, Uuid::new_v4(), 10, 14);
        let request = UpdateBookingRequest {
            remove_item_ids: vec![a.id],
            ..Default::default()
        };

        assert!(matches!(
            plan_item_changes(&[a], &request),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_item_ids_are_invalid() {
        let booking_id = Uuid::new_v4();
        let a = live_item(booking_id, Uuid::new_v4(), 10, 14);
        let request = UpdateBookingRequest {
            remove_item_ids: vec![Uuid::new_v4()],
            ..Default::default()
        };

        assert!(matches!(
            plan_item_changes(&[a], &request),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn replace_and_partial_changes_are_exclusive() {
        let request = UpdateBookingRequest {
            remove_item_ids: vec![Uuid::new_v4()],
            replace_items: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(validate_update(&request), Err(AppError::InvalidInput(_))));
    }

    // -------------------------------------------------------------------------
    // Edit engine
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn moving_a_hold_frees_the_old_slot() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();

        let details = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap();

        assert_eq!(details.booking.start_time, at(15));
        assert_eq!(details.items.len(), 1);
        assert_eq!(details.items[0].start_utc, at(15));
        assert_eq!(details.booking.status, BookingStatus::Hold);

        h.reserve(&castle, 1, 10, 14).await.unwrap();
    }

    #[tokio::test]
    async fn edit_does_not_conflict_with_its_own_items() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();

        // Same window, new address: the booking's own unit must not block it.
        let mut request = h.move_to(&castle, 10, 14);
        if let Some(fields) = request.event_fields.as_mut() {
            fields.event_address = Some("42 Party Lane".to_string());
        }

        let details = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &request)
            .await
            .unwrap();
        assert_eq!(details.booking.event_address, "42 Party Lane");
    }

    #[tokio::test]
    async fn edit_resets_hold_expiry_and_recomputes_totals() {
        let h = Harness::new().await;
        let castle = h.castle(2).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.clock.advance(Duration::minutes(20));

        let request = UpdateBookingRequest {
            add_items: vec![ItemRequest {
                inventory_id: castle.id,
                quantity: 1,
                start_utc: at(11),
                end_utc: at(13),
            }],
            ..Default::default()
        };
        let details = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &request)
            .await
            .unwrap();

        assert_eq!(details.booking.expires_at, Some(h.clock.now() + Duration::minutes(30)));
        assert_eq!(details.booking.subtotal_amount, castle.price * 2);
        assert_eq!(details.items.len(), 2);
    }

    #[tokio::test]
    async fn edit_into_a_taken_slot_conflicts_and_changes_nothing() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let mine = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.reserve(&castle, 1, 15, 18).await.unwrap();
        let (invoice, _) = h.attach_billing(mine.booking_id).await;
        let before = h.details(mine.booking_id).await;
        let events_before = h.publisher.events().len();

        let err = h
            .service
            .update_booking(h.business_id, mine.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict { .. }));
        assert_eq!(h.details(mine.booking_id).await, before);
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Open));
        assert!(h.billing.voided_invoices().is_empty());
        assert_eq!(h.publisher.events().len(), events_before);
    }

    #[tokio::test]
    async fn edit_voids_invoice_once_and_second_edit_is_clean() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, quote) = h.attach_billing(reserved.booking_id).await;

        let first = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap();

        assert_eq!(first.booking.invoice_id, None);
        assert_eq!(first.booking.quote_id, None);
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Void));
        assert_eq!(h.store.quote_status(quote.id).await, Some(QuoteStatus::Canceled));

        h.service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 10, 14))
            .await
            .unwrap();

        assert_eq!(h.billing.voided_invoices().len(), 1);
        assert_eq!(h.billing.canceled_quotes().len(), 1);
    }

    #[tokio::test]
    async fn billing_failure_rolls_back_the_edit() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, _) = h.attach_billing(reserved.booking_id).await;
        let before = h.details(reserved.booking_id).await;
        h.billing.fail_next(10);

        let err = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::DependencyFailure(_)));
        assert_eq!(h.details(reserved.booking_id).await, before);
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Open));
    }

    #[tokio::test]
    async fn confirmed_booking_rejects_edits_without_writing() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.service
            .confirm_booking(h.business_id, reserved.booking_id, &fixtures::paid(25_000))
            .await
            .unwrap();
        let writes = h.store.commits();
        let before = h.details(reserved.booking_id).await;

        let err = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(h.store.commits(), writes);
        assert_eq!(h.details(reserved.booking_id).await, before);
    }

    #[tokio::test]
    async fn pending_booking_edit_reopens_the_hold() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let mut pending = fixtures::paid(25_000);
        pending.payment_status = PaymentStatus::Pending;
        let confirmed = h
            .service
            .confirm_booking(h.business_id, reserved.booking_id, &pending)
            .await
            .unwrap();
        assert_eq!(confirmed.booking.status, BookingStatus::Pending);

        let edited = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap();
        assert_eq!(edited.booking.status, BookingStatus::Hold);
        assert!(edited.booking.expires_at.is_some());
    }

    #[tokio::test]
    async fn other_business_cannot_see_or_edit_a_booking() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let stranger = Uuid::new_v4();

        assert!(matches!(
            h.service.get_booking(stranger, reserved.booking_id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service
                .update_booking(stranger, reserved.booking_id, &h.move_to(&castle, 15, 18))
                .await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn soft_removed_item_stays_for_audit() {
        let h = Harness::new().await;
        let castle = h.castle(2).await;
        let reserved = h
            .reserve_items(vec![fixtures::item(&castle, 1, 10, 14), fixtures::item(&castle, 1, 10, 14)])
            .await
            .unwrap();
        let items = h.details(reserved.booking_id).await.items;

        let details = h
            .service
            .update_booking(
                h.business_id,
                reserved.booking_id,
                &UpdateBookingRequest {
                    remove_item_ids: vec![items[0].id],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(details.items.len(), 2);
        let removed = details.items.iter().find(|i| i.id == items[0].id).unwrap();
        assert_eq!(removed.booking_status, BookingStatus::Cancelled);
        assert_eq!(details.booking.subtotal_amount, castle.price);

        // The freed unit is bookable again.
        h.reserve(&castle, 1, 10, 14).await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_published_once() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let events_before = h.publisher.events().len();
        h.store.fail_next_commits(2);

        h.service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap();

        assert_eq!(h.publisher.events().len(), events_before + 1);
    }

    #[tokio::test]
    async fn retries_are_bounded_and_end_in_conflict() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let begun = h.store.transactions_begun();
        let events_before = h.publisher.events().len();
        h.store.fail_next_commits(100);

        let err = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict { .. }));
        assert_eq!(h.store.transactions_begun() - begun, 3);
        assert_eq!(h.publisher.events().len(), events_before);
    }

    #[tokio::test]
    async fn racing_edits_end_in_one_success_and_one_conflict() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let to_afternoon = h.move_to(&castle, 15, 18);
        let to_evening = h.move_to(&castle, 19, 22);
        let begun = h.store.transactions_begun();
        let max_attempts = h.service.policy.max_attempts as usize;

        // The evening edit loses every serialization race.
        let evening = at(19);
        h.store
            .reject_commits_where(move |state| state.bookings.iter().any(|b| b.start_time == evening));

        let (afternoon, evening_result) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(
                h.service.update_booking(h.business_id, reserved.booking_id, &to_afternoon),
                h.service.update_booking(h.business_id, reserved.booking_id, &to_evening),
            )
        })
        .await
        .expect("both edits finish");

        let winner = afternoon.unwrap();
        assert!(matches!(evening_result, Err(AppError::Conflict { .. })));
        assert_eq!(h.store.transactions_begun() - begun, 1 + max_attempts);

        let stored = h.store.booking(reserved.booking_id).await.unwrap();
        assert_eq!(stored, winner.booking);
        assert_eq!(stored.start_time, at(15));
        let live: Vec<_> = h
            .store
            .items(reserved.booking_id)
            .await
            .into_iter()
            .filter(|i| i.is_active())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!((live[0].start_utc, live[0].end_utc), (at(15), at(18)));
    }

    #[tokio::test]
    async fn failed_edit_after_remote_void_marks_billing_void_locally() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, quote) = h.attach_billing(reserved.booking_id).await;
        let events_before = h.publisher.events().len();
        h.store.fail_next_commits(h.service.policy.max_attempts as usize);

        let err = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict { .. }));
        assert!(h.billing.voided_invoices().contains(&invoice.stripe_invoice_id));
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Void));
        assert_eq!(h.store.quote_status(quote.id).await, Some(QuoteStatus::Canceled));

        let booking = h.store.booking(reserved.booking_id).await.unwrap();
        assert_eq!(booking.invoice_id, None);
        assert_eq!(booking.quote_id, None);
        assert_eq!(booking.status, BookingStatus::Hold);
        assert_eq!(booking.start_time, at(10));

        let items = h.store.items(reserved.booking_id).await;
        assert_eq!(items.len(), 1);
        assert_eq!((items[0].start_utc, items[0].end_utc), (at(10), at(14)));
        assert_eq!(h.publisher.events().len(), events_before + 1);
    }

    #[tokio::test]
    async fn failed_cancel_after_remote_void_keeps_the_booking_live() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, _) = h.attach_billing(reserved.booking_id).await;
        h.store.fail_next_commits(h.service.policy.max_attempts as usize);

        let err = h
            .service
            .cancel_booking(h.business_id, reserved.booking_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict { .. }));
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Void));
        let booking = h.store.booking(reserved.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Hold);
        assert_eq!(booking.invoice_id, None);
        assert!(matches!(
            h.reserve(&castle, 1, 10, 14).await,
            Err(AppError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn successful_edit_after_retry_needs_no_settling() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, _) = h.attach_billing(reserved.booking_id).await;
        h.store.fail_next_commits(1);
        let commits = h.store.commits();

        let details = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap();

        assert_eq!(details.booking.start_time, at(15));
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Void));
        assert_eq!(h.store.commits() - commits, 1);
    }

    // -------------------------------------------------------------------------
    // Cancel / confirm / complete
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_releases_capacity_and_voids_billing() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, _) = h.attach_billing(reserved.booking_id).await;

        let details = h
            .service
            .cancel_booking(h.business_id, reserved.booking_id)
            .await
            .unwrap();

        assert_eq!(details.booking.status, BookingStatus::Cancelled);
        assert_eq!(details.booking.expires_at, None);
        assert!(details.items.iter().all(|i| i.booking_status == BookingStatus::Cancelled));
        assert_eq!(h.store.invoice_status(invoice.id).await, Some(InvoiceStatus::Void));

        h.reserve(&castle, 1, 10, 14).await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_twice_publishes_once() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let events_before = h.publisher.events().len();

        h.service.cancel_booking(h.business_id, reserved.booking_id).await.unwrap();
        let again = h.service.cancel_booking(h.business_id, reserved.booking_id).await.unwrap();

        assert_eq!(again.booking.status, BookingStatus::Cancelled);
        assert_eq!(h.publisher.events().len(), events_before + 1);
    }

    #[tokio::test]
    async fn confirm_records_payment_and_clears_expiry() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();

        let details = h
            .service
            .confirm_booking(h.business_id, reserved.booking_id, &fixtures::paid(25_000))
            .await
            .unwrap();

        assert_eq!(details.booking.status, BookingStatus::Confirmed);
        assert_eq!(details.booking.expires_at, None);
        assert_eq!(details.payments.len(), 1);
        assert!(details.items.iter().all(|i| i.booking_status == BookingStatus::Confirmed));

        // Confirmed bookings keep blocking capacity past the old hold expiry.
        h.clock.advance(Duration::minutes(45));
        assert!(matches!(
            h.reserve(&castle, 1, 12, 13).await,
            Err(AppError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn confirming_an_expired_hold_whose_slot_was_taken_conflicts() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let stale = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.clock.advance(Duration::minutes(31));
        h.reserve(&castle, 1, 12, 16).await.unwrap();

        let err = h
            .service
            .confirm_booking(h.business_id, stale.booking_id, &fixtures::paid(25_000))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn confirming_an_expired_hold_with_free_capacity_succeeds() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let stale = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.clock.advance(Duration::minutes(31));

        let details = h
            .service
            .confirm_booking(h.business_id, stale.booking_id, &fixtures::paid(25_000))
            .await
            .unwrap();
        assert_eq!(details.booking.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn complete_requires_a_paid_or_pending_booking() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();

        assert!(matches!(
            h.service.complete_booking(h.business_id, reserved.booking_id).await,
            Err(AppError::InvalidState(_))
        ));

        h.service
            .confirm_booking(h.business_id, reserved.booking_id, &fixtures::paid(25_000))
            .await
            .unwrap();
        let done = h
            .service
            .complete_booking(h.business_id, reserved.booking_id)
            .await
            .unwrap();
        assert_eq!(done.booking.status, BookingStatus::Completed);
    }

    // -------------------------------------------------------------------------
    // Billing artifacts & waivers
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn second_active_invoice_is_rejected() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        h.attach_billing(reserved.booking_id).await;

        let err = h
            .service
            .attach_invoice(h.business_id, reserved.booking_id, &fixtures::open_invoice("in_second"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn paid_invoice_blocks_edits() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();
        let (invoice, _) = h.attach_billing(reserved.booking_id).await;
        h.store.force_invoice_status(invoice.id, InvoiceStatus::Paid).await;

        let err = h
            .service
            .update_booking(h.business_id, reserved.booking_id, &h.move_to(&castle, 15, 18))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn signing_a_waiver_publishes_a_waiver_event() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        let reserved = h.reserve(&castle, 1, 10, 14).await.unwrap();

        let waiver = h
            .service
            .sign_waiver(
                h.business_id,
                reserved.booking_id,
                &SignWaiverRequest { signer_name: " Pat Doe ".to_string() },
            )
            .await
            .unwrap();

        assert_eq!(waiver.signer_name, "Pat Doe");
        let last = h.publisher.events().pop().unwrap();
        assert_eq!(last.entity, crate::publisher::ChangeEntity::Waiver);
    }

    #[tokio::test]
    async fn availability_check_reports_conflicts_without_writing() {
        let h = Harness::new().await;
        let castle = h.castle(1).await;
        h.reserve(&castle, 1, 10, 14).await.unwrap();
        let writes = h.store.commits();

        let busy = AvailabilityRequest {
            business_id: h.business_id,
            items: vec![fixtures::item(&castle, 1, 12, 16)],
        };
        let free = AvailabilityRequest {
            business_id: h.business_id,
            items: vec![fixtures::item(&castle, 1, 15, 18)],
        };

        assert!(matches!(
            h.service.check_availability(&busy).await,
            Err(AppError::Conflict { .. })
        ));
        h.service.check_availability(&free).await.unwrap();
        assert_eq!(h.store.commits(), writes);
    }
}
