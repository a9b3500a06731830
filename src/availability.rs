// =============================================================================
// AVAILABILITY MODULE
// =============================================================================
// The conflict checker. Given requested line items and the items already
// committed against the same inventory, decides whether every requested unit
// fits under the inventory's capacity at every instant of its window.
//
// Periods are closed intervals: [10:00, 14:00] and [14:00, 18:00] share the
// instant 14:00 and therefore overlap.
//
// The check is pure. Callers load inventory and committed items inside the
// same serializable transaction that writes the result.
// =============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Inventory, InventoryStatus, ItemRequest};

// -----------------------------------------------------------------------------
// PERIOD
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// Build a period, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> AppResult<Self> {
        if start >= end {
            return Err(AppError::InvalidInput(format!(
                "time range must end after it starts ({start} .. {end})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Inclusive intersection test: `a.start <= b.end && b.start <= a.end`.
    pub fn overlaps(&self, other: &Period) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Period) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest period covering all of `periods`.
    pub fn span<I>(periods: I) -> Option<Period>
    where
        I: IntoIterator<Item = Period>,
    {
        periods.into_iter().reduce(|acc, p| Period {
            start: acc.start.min(p.start),
            end: acc.end.max(p.end),
        })
    }
}

/// Quantity of one inventory type already promised over a period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedItem {
    pub inventory_id: Uuid,
    pub quantity: i32,
    pub period: Period,
}

// -----------------------------------------------------------------------------
// INPUT VALIDATION
// -----------------------------------------------------------------------------
/// Reject malformed item lists before any transaction is opened.
pub fn validate_items(items: &[ItemRequest]) -> AppResult<()> {
    if items.is_empty() {
        return Err(AppError::InvalidInput(
            "at least one item is required".to_string(),
        ));
    }

    for item in items {
        if item.quantity <= 0 {
            return Err(AppError::InvalidInput(format!(
                "quantity for inventory {} must be positive, got {}",
                item.inventory_id, item.quantity
            )));
        }
        Period::new(item.start_utc, item.end_utc)?;
    }

    Ok(())
}

/// Period covering every item in the request.
pub fn request_window(items: &[ItemRequest]) -> AppResult<Period> {
    let periods = items
        .iter()
        .map(|item| Period::new(item.start_utc, item.end_utc))
        .collect::<AppResult<Vec<_>>>()?;

    Period::span(periods)
        .ok_or_else(|| AppError::InvalidInput("at least one item is required".to_string()))
}

// -----------------------------------------------------------------------------
// PEAK USAGE
// -----------------------------------------------------------------------------
/// Highest total quantity of `inventory_id` committed at any single instant
/// inside `window`.
///
/// Sweeps the clipped interval endpoints in time order. At equal instants
/// starts are applied before ends, because closed intervals that merely
/// touch still coincide at that instant.
pub fn peak_committed(committed: &[CommittedItem], inventory_id: Uuid, window: &Period) -> i32 {
    let mut edges: Vec<(DateTime<Utc>, u8, i32)> = committed
        .iter()
        .filter(|c| c.inventory_id == inventory_id && c.period.overlaps(window))
        .flat_map(|c| {
            let start = c.period.start.max(window.start);
            let end = c.period.end.min(window.end);
            [(start, 0, c.quantity), (end, 1, -c.quantity)]
        })
        .collect();

    edges.sort_by_key(|&(at, order, _)| (at, order));

    let mut running = 0;
    let mut peak = 0;
    for (_, _, delta) in edges {
        running += delta;
        peak = peak.max(running);
    }
    peak
}

// -----------------------------------------------------------------------------
// CONFLICT CHECK
// -----------------------------------------------------------------------------
/// Check every requested item against the inventory ledger and the items
/// already committed.
///
/// Items are admitted in order; an admitted item counts against later items
/// of the same request, so two lines for the same castle cannot together
/// exceed its quantity.
///
/// # Errors
/// - `InvalidInput` for unknown inventory or malformed items
/// - `Conflict` naming the first inventory item that does not fit
pub fn check(
    items: &[ItemRequest],
    inventory: &HashMap<Uuid, Inventory>,
    committed: &[CommittedItem],
) -> AppResult<()> {
    validate_items(items)?;

    let mut pool = committed.to_vec();

    for item in items {
        let ledger = inventory.get(&item.inventory_id).ok_or_else(|| {
            AppError::InvalidInput(format!("unknown inventory item {}", item.inventory_id))
        })?;

        if ledger.status != InventoryStatus::Available {
            return Err(AppError::conflict(
                ledger.id,
                format!("{} is not available for rent", ledger.name),
            ));
        }

        let period = Period::new(item.start_utc, item.end_utc)?;
        let peak = peak_committed(&pool, item.inventory_id, &period);
        let free = (ledger.quantity - peak).max(0);

        if item.quantity > free {
            return Err(AppError::conflict(
                ledger.id,
                format!(
                    "{} has {} of {} units free between {} and {}, {} requested",
                    ledger.name, free, ledger.quantity, period.start, period.end, item.quantity
                ),
            ));
        }

        pool.push(CommittedItem {
            inventory_id: item.inventory_id,
            quantity: item.quantity,
            period,
        });
    }

    Ok(())
}
