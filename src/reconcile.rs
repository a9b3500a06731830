// =============================================================================
// RECONCILE MODULE
// =============================================================================
// Keeps billing artifacts consistent with booking state. When a booking is
// edited, cancelled or expires, its active invoice is voided and its active
// quote is cancelled, first remotely and then locally, and the booking's
// reference to each is cleared. The rows stay behind (VOID / CANCELED) for
// audit.
//
// The remote call happens before the local status change. If it fails the
// error aborts the surrounding transaction, so local state never claims VOID
// while the provider still considers the invoice payable.
//
// The reverse can also happen: the provider accepted the call but the local
// transaction never committed. Every successful remote call is written to a
// `RemoteInvalidations` ledger that outlives the attempt, and a caller whose
// operation fails for good replays it with `mark_invalidated`.
// =============================================================================

use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::billing::BillingProvider;
use crate::error::AppResult;
use crate::models::{Booking, InvoiceStatus, QuoteStatus};
use crate::store::BookingTx;

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub voided_invoice: Option<Uuid>,
    pub canceled_quote: Option<Uuid>,
}

impl Reconciled {
    pub fn is_noop(&self) -> bool {
        self.voided_invoice.is_none() && self.canceled_quote.is_none()
    }
}

/// Artifacts the billing provider has invalidated during one operation,
/// across all of its attempts.
#[derive(Debug, Default)]
pub struct RemoteInvalidations {
    done: Mutex<Reconciled>,
}

impl RemoteInvalidations {
    fn record_invoice(&self, invoice_id: Uuid) {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .voided_invoice = Some(invoice_id);
    }

    fn record_quote(&self, quote_id: Uuid) {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .canceled_quote = Some(quote_id);
    }

    pub fn snapshot(&self) -> Reconciled {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Void the booking's active invoice and cancel its active quote.
///
/// Clears `booking.invoice_id` / `booking.quote_id` for whatever it
/// invalidated; the caller persists the booking. Inactive artifacts are
/// left alone: a VOID invoice or CANCELED quote just loses its reference,
/// a PAID invoice or ACCEPTED quote stays attached. Calling this on a
/// booking without active artifacts does nothing.
///
/// A DRAFT invoice was never sent, so it is deleted at the provider rather
/// than voided. Locally both end as VOID.
///
/// Each remote call that succeeds is recorded in `remote`.
///
/// # Errors
/// `DependencyFailure` when the billing provider rejects the call.
pub async fn reconcile<T>(
    tx: &mut T,
    billing: &dyn BillingProvider,
    remote: &RemoteInvalidations,
    booking: &mut Booking,
    now: DateTime<Utc>,
) -> AppResult<Reconciled>
where
    T: BookingTx,
{
    let mut outcome = Reconciled::default();

    if let Some(invoice_id) = booking.invoice_id {
        match tx.invoice(invoice_id).await? {
            Some(invoice) if invoice.status.is_active() => {
                if invoice.status == InvoiceStatus::Draft {
                    billing.delete_draft_invoice(&invoice.stripe_invoice_id).await?;
                } else {
                    billing.void_invoice(&invoice.stripe_invoice_id).await?;
                }
                remote.record_invoice(invoice.id);
                tx.set_invoice_status(invoice.id, InvoiceStatus::Void, now).await?;
                booking.invoice_id = None;
                outcome.voided_invoice = Some(invoice.id);

                tracing::info!(
                    booking_id = %booking.id,
                    invoice_id = %invoice.id,
                    "Voided invoice for changed booking"
                );
            }
            Some(invoice) if invoice.status == InvoiceStatus::Paid => {}
            _ => booking.invoice_id = None,
        }
    }

    if let Some(quote_id) = booking.quote_id {
        match tx.quote(quote_id).await? {
            Some(quote) if quote.status.is_active() => {
                billing.cancel_quote(&quote.stripe_quote_id).await?;
                remote.record_quote(quote.id);
                tx.set_quote_status(quote.id, QuoteStatus::Canceled, now).await?;
                booking.quote_id = None;
                outcome.canceled_quote = Some(quote.id);

                tracing::info!(
                    booking_id = %booking.id,
                    quote_id = %quote.id,
                    "Canceled quote for changed booking"
                );
            }
            Some(quote) if quote.status == QuoteStatus::Accepted => {}
            _ => booking.quote_id = None,
        }
    }

    Ok(outcome)
}

/// Bring local rows in line with invalidations the provider already made:
/// still-active artifacts become VOID / CANCELED and the booking stops
/// referencing them. Items and booking status are not touched.
///
/// Returns whether `booking` changed; the caller persists it.
pub async fn mark_invalidated<T>(
    tx: &mut T,
    booking: &mut Booking,
    invalidated: &Reconciled,
    now: DateTime<Utc>,
) -> AppResult<bool>
where
    T: BookingTx,
{
    let mut changed = false;

    if let Some(invoice_id) = invalidated.voided_invoice {
        if let Some(invoice) = tx.invoice(invoice_id).await? {
            if invoice.status.is_active() {
                tx.set_invoice_status(invoice.id, InvoiceStatus::Void, now).await?;
            }
        }
        if booking.invoice_id == Some(invoice_id) {
            booking.invoice_id = None;
            changed = true;
        }
    }

    if let Some(quote_id) = invalidated.canceled_quote {
        if let Some(quote) = tx.quote(quote_id).await? {
            if quote.status.is_active() {
                tx.set_quote_status(quote.id, QuoteStatus::Canceled, now).await?;
            }
        }
        if booking.quote_id == Some(quote_id) {
            booking.quote_id = None;
            changed = true;
        }
    }

    Ok(changed)
}
