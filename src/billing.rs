// =============================================================================
// BILLING MODULE
// =============================================================================
// Client side of the billing provider (Stripe). The booking core only ever
// asks it to invalidate artifacts. Finalized invoices are voided, drafts are
// deleted, quotes are cancelled.
//
// Every call is idempotent from the caller's point of view: asking to void
// an invoice Stripe already reports as void (or has deleted) succeeds, so a
// transaction that voided remotely and then lost a serialization race can
// safely retry.
// =============================================================================

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Void a remote invoice so it can no longer be paid.
    async fn void_invoice(&self, stripe_invoice_id: &str) -> AppResult<()>;

    /// Delete a remote invoice that was never finalized.
    async fn delete_draft_invoice(&self, stripe_invoice_id: &str) -> AppResult<()>;

    /// Cancel a remote quote so it can no longer be accepted.
    async fn cancel_quote(&self, stripe_quote_id: &str) -> AppResult<()>;
}

// =============================================================================
// STRIPE
// =============================================================================
#[derive(Clone)]
pub struct StripeBilling {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

/// The part of a Stripe object this service reads back
#[derive(Debug, Deserialize)]
struct StripeObject {
    status: Option<String>,
}

/// One invalidating call against the Stripe API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
    VoidInvoice,
    DeleteDraftInvoice,
    CancelQuote,
}

impl Invalidation {
    fn collection(self) -> &'static str {
        match self {
            Self::VoidInvoice | Self::DeleteDraftInvoice => "invoices",
            Self::CancelQuote => "quotes",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::VoidInvoice => "void",
            Self::DeleteDraftInvoice => "delete",
            Self::CancelQuote => "cancel",
        }
    }
}

/// Next move after Stripe rejected an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// The object can no longer be paid or accepted
    Done,
    /// The object is in a state another call handles
    Switch(Invalidation),
    Failed,
}

/// Decide from the object's remote status (`None`: the object no longer
/// exists) whether a rejected call still reached its goal.
///
/// Stripe voids only finalized invoices and deletes only drafts, so a
/// local status that lags behind the remote one is corrected by switching
/// calls once.
fn resolve_rejection(attempted: Invalidation, remote_status: Option<&str>) -> Resolution {
    match (attempted, remote_status) {
        (Invalidation::CancelQuote, Some("canceled")) => Resolution::Done,
        (Invalidation::CancelQuote, _) => Resolution::Failed,

        (_, None | Some("void")) => Resolution::Done,
        (Invalidation::VoidInvoice, Some("draft")) => {
            Resolution::Switch(Invalidation::DeleteDraftInvoice)
        }
        (Invalidation::DeleteDraftInvoice, Some("open" | "uncollectible")) => {
            Resolution::Switch(Invalidation::VoidInvoice)
        }
        _ => Resolution::Failed,
    }
}

impl StripeBilling {
    pub fn new(api_base: impl Into<String>, secret_key: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    /// Run `call`; on rejection, read the object back and either accept,
    /// switch to the call that fits its remote state, or fail.
    async fn invalidate(&self, mut call: Invalidation, object_id: &str) -> AppResult<()> {
        let mut switched = false;

        loop {
            let status = self.send(call, object_id).await?;
            if status.is_success() {
                tracing::info!(object_id, action = call.name(), "Billing artifact invalidated");
                return Ok(());
            }
            if !status.is_client_error() {
                return Err(AppError::DependencyFailure(format!(
                    "{} {object_id}: provider answered {status}",
                    call.name()
                )));
            }

            let remote = self.remote_status(call.collection(), object_id).await?;
            match resolve_rejection(call, remote.as_deref()) {
                Resolution::Done => {
                    tracing::info!(
                        object_id,
                        action = call.name(),
                        remote_status = ?remote,
                        "Billing artifact was already invalidated"
                    );
                    return Ok(());
                }
                Resolution::Switch(next) if !switched => {
                    tracing::info!(object_id, from = call.name(), to = next.name(), "Switching billing call");
                    call = next;
                    switched = true;
                }
                _ => {
                    return Err(AppError::DependencyFailure(format!(
                        "{} {object_id}: provider answered {status}, object is {}",
                        call.name(),
                        remote.as_deref().unwrap_or("gone")
                    )))
                }
            }
        }
    }

    async fn send(&self, call: Invalidation, object_id: &str) -> AppResult<StatusCode> {
        let collection = call.collection();
        let request = match call {
            Invalidation::DeleteDraftInvoice => self
                .client
                .delete(format!("{}/v1/{collection}/{object_id}", self.api_base)),
            Invalidation::VoidInvoice | Invalidation::CancelQuote => self
                .client
                .post(format!("{}/v1/{collection}/{object_id}/{}", self.api_base, call.name()))
                .header("Idempotency-Key", format!("{}-{object_id}", call.name())),
        };

        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| {
                AppError::DependencyFailure(format!("{} {object_id}: request failed: {e}", call.name()))
            })?;

        Ok(response.status())
    }

    /// Current remote status; `None` when the object does not exist.
    async fn remote_status(&self, collection: &str, object_id: &str) -> AppResult<Option<String>> {
        let url = format!("{}/v1/{collection}/{object_id}", self.api_base);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::DependencyFailure(format!("fetch {object_id}: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let object: StripeObject = response
            .error_for_status()
            .map_err(|e| AppError::DependencyFailure(format!("fetch {object_id}: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::DependencyFailure(format!("decode {object_id}: {e}")))?;

        Ok(Some(object.status.unwrap_or_default()))
    }
}

#[async_trait]
impl BillingProvider for StripeBilling {
    async fn void_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        self.invalidate(Invalidation::VoidInvoice, stripe_invoice_id).await
    }

    async fn delete_draft_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        self.invalidate(Invalidation::DeleteDraftInvoice, stripe_invoice_id).await
    }

    async fn cancel_quote(&self, stripe_quote_id: &str) -> AppResult<()> {
        self.invalidate(Invalidation::CancelQuote, stripe_quote_id).await
    }
}

// =============================================================================
// LOGGING ONLY
// =============================================================================
/// Used when no Stripe key is configured (local development).
#[derive(Debug, Clone, Default)]
pub struct LoggingBilling;

#[async_trait]
impl BillingProvider for LoggingBilling {
    async fn void_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        tracing::info!(stripe_invoice_id, "Billing disabled; invoice void not sent");
        Ok(())
    }

    async fn delete_draft_invoice(&self, stripe_invoice_id: &str) -> AppResult<()> {
        tracing::info!(stripe_invoice_id, "Billing disabled; draft invoice delete not sent");
        Ok(())
    }

    async fn cancel_quote(&self, stripe_quote_id: &str) -> AppResult<()> {
        tracing::info!(stripe_quote_id, "Billing disabled; quote cancel not sent");
        Ok(())
    }
}
