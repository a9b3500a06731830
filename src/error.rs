// =============================================================================
// ERROR MODULE
// =============================================================================
// Typed errors for the booking core and their HTTP responses.
//
// Business-rule and conflict errors are classified where they happen (inside
// the transaction function); the HTTP layer maps each variant to a status
// code exactly once, in `into_response`.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorResponse;

// -----------------------------------------------------------------------------
// SQLSTATE CODES
// -----------------------------------------------------------------------------
// Database errors that mean "another transaction won the race". The whole
// transaction is safe to re-run; anything else is permanent.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const EXCLUSION_VIOLATION: &str = "23P01";
const UNIQUE_VIOLATION: &str = "23505";

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // CALLER ERRORS
    // -------------------------------------------------------------------------
    /// Malformed request: missing fields, non-positive quantity, bad range
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Booking missing or owned by another business
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the booking's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // CONFLICTS
    // -------------------------------------------------------------------------
    /// Not enough capacity, or retries exhausted after concurrent writers
    #[error("Conflict: {reason}")]
    Conflict {
        inventory_id: Option<Uuid>,
        reason: String,
    },

    /// Serialization failure or capacity-constraint violation reported by the
    /// database. Only ever seen by the retry loop.
    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    // -------------------------------------------------------------------------
    // DEPENDENCY & INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Billing provider failed to void/cancel a remote artifact
    #[error("Billing provider failure: {0}")]
    DependencyFailure(String),

    /// Database query failed
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Capacity conflict on a specific inventory item.
    pub fn conflict(inventory_id: Uuid, reason: impl Into<String>) -> Self {
        AppError::Conflict {
            inventory_id: Some(inventory_id),
            reason: reason.into(),
        }
    }

    /// Whether re-running the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientConflict(_) | AppError::DependencyFailure(_)
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } | AppError::TransientConflict(_) => StatusCode::CONFLICT,
            AppError::DependencyFailure(_)
            | AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code, used in response bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::Conflict { .. } | AppError::TransientConflict(_) => "CONFLICT",
            AppError::DependencyFailure(_) => "DEPENDENCY_FAILURE",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Final form of an error once the retry budget is spent.
    ///
    /// A transient conflict never reaches callers as-is: it becomes a
    /// `Conflict` telling them to start over with fresh availability.
    pub fn exhausted(self) -> Self {
        match self {
            AppError::TransientConflict(detail) => {
                tracing::warn!(detail = %detail, "Giving up after concurrent modifications");
                AppError::Conflict {
                    inventory_id: None,
                    reason: "the booking changed while it was being saved; \
                             re-check availability and try again"
                        .to_string(),
                }
            }
            other => other,
        }
    }
}

// -----------------------------------------------------------------------------
// DATABASE ERROR CLASSIFICATION
// -----------------------------------------------------------------------------
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
                matches!(
                    code.as_ref(),
                    SERIALIZATION_FAILURE | DEADLOCK_DETECTED | EXCLUSION_VIOLATION | UNIQUE_VIOLATION
                )
            }),
            _ => false,
        };

        if transient {
            AppError::TransientConflict(err.to_string())
        } else {
            AppError::Database(err)
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut inventory_id = None;

        let message = match &self {
            AppError::InvalidInput(msg) | AppError::NotFound(msg) | AppError::InvalidState(msg) => {
                msg.clone()
            }

            AppError::Conflict {
                inventory_id: id,
                reason,
            } => {
                inventory_id = *id;
                reason.clone()
            }

            AppError::TransientConflict(_) => {
                "the booking changed while it was being saved".to_string()
            }

            AppError::DependencyFailure(_) => {
                "the billing provider could not be reconciled".to_string()
            }

            // Internal details stay in the logs.
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Redis(_) => "A cache error occurred".to_string(),
            AppError::Internal(_) => "An internal error occurred".to_string(),
        };

        let status = self.status();
        let error_code = self.code();
        if status.is_server_error() {
            tracing::error!(error_code = error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = error_code, message = %message, "Request rejected");
        }

        let mut body = ErrorResponse::new(error_code, message);
        body.inventory_id = inventory_id;

        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
