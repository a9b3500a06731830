// =============================================================================
// CLOCK MODULE
// =============================================================================
// Every "now" the booking core reads (hold expiry, committed-quantity
// queries, audit timestamps) goes through this trait so tests can move time.
// =============================================================================

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
