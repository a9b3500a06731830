// =============================================================================
// HOLDS MODULE
// =============================================================================
// Temporary reservations. `reserve` creates a HOLD booking that blocks
// capacity until `expires_at`; after that instant the availability checker
// ignores it even before anything rewrites the row.
//
// The sweeper turns expired holds into CANCELLED bookings so the table
// reflects reality and their invoices/quotes get invalidated. It runs every
// `HOLD_SWEEP_INTERVAL_SECS` and handles each hold in its own transaction.
// =============================================================================

use chrono_tz::Tz;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::availability;
use crate::bookings::{
    build_items, compute_totals, ensure_within_event, observe, release_booking,
    validate_event_details, verify_capacity, BookingService, ItemDraft,
};
use crate::error::AppResult;
use crate::metrics;
use crate::models::{Booking, BookingStatus, ReserveRequest, ReserveResponse};
use crate::publisher::ChangeEvent;
use crate::reconcile::RemoteInvalidations;
use crate::retry::run_with_retry;
use crate::store::{BookingStore, BookingTx};

/// Holds released per sweep pass
const SWEEP_BATCH: i64 = 100;

impl<S: BookingStore> BookingService<S> {
    // -------------------------------------------------------------------------
    // RESERVE
    // -------------------------------------------------------------------------
    /// Create a HOLD booking for `request.items`.
    ///
    /// # Returns
    /// The new booking's id and the instant its hold lapses.
    ///
    /// # Errors
    /// - `InvalidInput` for malformed items or event details
    /// - `Conflict` when any item does not fit (nothing is written)
    pub async fn reserve(&self, request: &ReserveRequest) -> AppResult<ReserveResponse> {
        let business_id = request.business_id;
        tracing::info!(%business_id, items = request.items.len(), "Reserving booking");

        availability::validate_items(&request.items)?;
        let tz = validate_event_details(&request.event_details)?;
        ensure_within_event(
            &request.items,
            request.event_details.start_time,
            request.event_details.end_time,
        )?;

        let result = run_with_retry(&self.policy, "reserve", |_| self.reserve_once(request, tz)).await;
        observe("reserve", &result);

        let booking = result?;
        self.publish(ChangeEvent::booking_inserted(&booking)).await;

        let expires_at = booking.expires_at.unwrap_or(booking.created_at + self.hold_ttl);
        info!(booking_id = %booking.id, %expires_at, total = booking.total_amount, "Hold created");

        Ok(ReserveResponse {
            booking_id: booking.id,
            expires_at,
        })
    }

    async fn reserve_once(&self, request: &ReserveRequest, tz: Tz) -> AppResult<Booking> {
        let now = self.clock.now();
        let details = &request.event_details;
        let mut tx = self.store.begin().await?;

        let inventory = verify_capacity(&mut tx, request.business_id, &request.items, now).await?;

        let mut booking = Booking {
            id: Uuid::new_v4(),
            business_id: request.business_id,
            customer_id: details.customer_id,
            event_date: details.start_time.with_timezone(&tz).date_naive(),
            start_time: details.start_time,
            end_time: details.end_time,
            timezone: tz.name().to_string(),
            event_address: details.event_address.clone(),
            event_city: details.event_city.clone(),
            event_state: details.event_state.clone(),
            event_zip: details.event_zip.clone(),
            participant_count: details.participant_count,
            status: BookingStatus::Hold,
            subtotal_amount: 0,
            tax_rate_bps: details.tax_rate_bps,
            tax_amount: 0,
            total_amount: 0,
            expires_at: Some(now + self.hold_ttl),
            coupon_id: details.coupon_id,
            invoice_id: None,
            quote_id: None,
            created_at: now,
            updated_at: now,
        };

        let drafts: Vec<ItemDraft> = request.items.iter().map(ItemDraft::fresh).collect();
        let items = build_items(booking.id, &drafts, &inventory, BookingStatus::Hold, now)?;
        compute_totals(&items, booking.tax_rate_bps).apply(&mut booking);

        tx.insert_booking(&booking).await?;
        tx.insert_items(&items).await?;
        tx.commit().await?;

        Ok(booking)
    }

    // -------------------------------------------------------------------------
    // EXPIRY
    // -------------------------------------------------------------------------
    /// Cancel up to `batch` expired holds. Returns how many were released.
    ///
    /// A failure on one hold is logged and does not stop the pass.
    pub async fn sweep_expired_holds(&self, batch: i64) -> AppResult<usize> {
        let now = self.clock.now();
        let expired = {
            let mut tx = self.store.begin().await?;
            tx.expired_holds(now, batch).await?
        };

        let mut released = 0;
        for booking in expired {
            match self.expire_hold(booking.business_id, booking.id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(booking_id = %booking.id, error = %err, "Failed to release expired hold");
                }
            }
        }

        metrics::record_holds_expired(released);
        Ok(released)
    }

    /// Cancel one hold if it is still an expired HOLD once locked.
    ///
    /// Returns `false` when the booking was confirmed, edited or cancelled
    /// since it was listed.
    pub async fn expire_hold(&self, business_id: Uuid, booking_id: Uuid) -> AppResult<bool> {
        let remote = RemoteInvalidations::default();
        let result = run_with_retry(&self.policy, "expire_hold", |_| {
            self.expire_hold_once(business_id, booking_id, &remote)
        })
        .await;
        let changed = self.settle_remote(business_id, booking_id, &remote, result).await?;

        match changed {
            Some((previous, current)) => {
                info!(%booking_id, "Expired hold released");
                self.publish(ChangeEvent::booking_updated(&previous, &current))
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_hold_once(
        &self,
        business_id: Uuid,
        booking_id: Uuid,
        remote: &RemoteInvalidations,
    ) -> AppResult<Option<(Booking, Booking)>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut booking = match tx.find_booking_for_update(business_id, booking_id).await? {
            Some(booking) if booking.is_expired_hold(now) => booking,
            _ => return Ok(None),
        };

        let previous = booking.clone();
        release_booking(&mut tx, self.billing.as_ref(), remote, &mut booking, now).await?;
        tx.commit().await?;

        Ok(Some((previous, booking)))
    }
}

/// Run `sweep_expired_holds` every `every` until the process exits.
pub fn spawn_hold_sweeper<S>(service: BookingService<S>, every: Duration) -> JoinHandle<()>
where
    S: BookingStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match service.sweep_expired_holds(SWEEP_BATCH).await {
                Ok(0) => {}
                Ok(released) => info!(released, "Hold sweep finished"),
                Err(err) => error!(error = %err, "Hold sweep failed"),
            }
        }
    })
}
