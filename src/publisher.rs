// =============================================================================
// PUBLISHER MODULE
// =============================================================================
// Change notifications for realtime listeners (dashboards, customer portals).
//
// The booking service publishes exactly once per committed transaction,
// after the commit returns. Rolled-back or retried attempts never publish.
// Delivery is best effort: the state change is already durable, so a
// failed publish is logged and counted, not returned to the caller.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Booking, Waiver};

// -----------------------------------------------------------------------------
// EVENT SHAPE
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEntity {
    Booking,
    Waiver,
}

impl ChangeEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeEntity::Booking => "booking",
            ChangeEntity::Waiver => "waiver",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChangeRow {
    Booking(Booking),
    Waiver(Waiver),
}

/// One row-level change
///
/// # Example JSON
/// ```json
/// {
///   "type": "UPDATE",
///   "entity": "booking",
///   "businessId": "…",
///   "row": { "id": "…", "status": "HOLD", … },
///   "previousRow": { "id": "…", "status": "PENDING", … }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity: ChangeEntity,
    pub business_id: Uuid,
    pub row: ChangeRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_row: Option<ChangeRow>,
}

impl ChangeEvent {
    pub fn booking_inserted(booking: &Booking) -> Self {
        Self {
            kind: ChangeKind::Insert,
            entity: ChangeEntity::Booking,
            business_id: booking.business_id,
            row: ChangeRow::Booking(booking.clone()),
            previous_row: None,
        }
    }

    pub fn booking_updated(previous: &Booking, current: &Booking) -> Self {
        Self {
            kind: ChangeKind::Update,
            entity: ChangeEntity::Booking,
            business_id: current.business_id,
            row: ChangeRow::Booking(current.clone()),
            previous_row: Some(ChangeRow::Booking(previous.clone())),
        }
    }

    pub fn waiver_signed(waiver: &Waiver) -> Self {
        Self {
            kind: ChangeKind::Insert,
            entity: ChangeEntity::Waiver,
            business_id: waiver.business_id,
            row: ChangeRow::Waiver(waiver.clone()),
            previous_row: None,
        }
    }

    /// Channel name: `{prefix}:{businessId}:{entity}`
    pub fn channel(&self, prefix: &str) -> String {
        format!("{prefix}:{}:{}", self.business_id, self.entity.as_str())
    }
}

// -----------------------------------------------------------------------------
// PUBLISHER TRAIT
// -----------------------------------------------------------------------------
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> AppResult<()>;
}

/// Publish a committed change, logging (not returning) failures.
pub async fn publish_committed(publisher: &dyn ChangePublisher, event: ChangeEvent) {
    match publisher.publish(&event).await {
        Ok(()) => metrics::record_change_event(event.entity.as_str(), true),
        Err(err) => {
            metrics::record_change_event(event.entity.as_str(), false);
            tracing::error!(
                entity = event.entity.as_str(),
                business_id = %event.business_id,
                error = %err,
                "Failed to publish change event"
            );
        }
    }
}

// =============================================================================
// REDIS PUB/SUB
// =============================================================================
#[derive(Clone)]
pub struct RedisPublisher {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisPublisher {
    pub fn new(conn: redis::aio::ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ChangePublisher for RedisPublisher {
    async fn publish(&self, event: &ChangeEvent) -> AppResult<()> {
        let start = Instant::now();
        let payload = serde_json::to_string(event)
            .map_err(|e| AppError::Internal(format!("failed to encode change event: {e}")))?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(event.channel(&self.prefix))
            .arg(payload)
            .query_async(&mut self.conn.clone())
            .await?;

        metrics::record_redis_operation("publish", start.elapsed().as_secs_f64());
        tracing::debug!(
            channel = %event.channel(&self.prefix),
            receivers,
            "Change event published"
        );

        Ok(())
    }
}
