// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL access for the booking core.
//
// - `Database` wraps the connection pool: startup tasks (migrations, demo
//   data), inventory listing and health checks.
// - `PgBookingTx` is one SERIALIZABLE transaction implementing `BookingTx`.
//   Dropping it without `commit` rolls back.
//
// Capacity is checked twice: in the service (clean Conflict errors) and by
// the deferred `booking_items_capacity` trigger at commit (backstop).
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use std::time::Instant;
use uuid::Uuid;

use crate::availability::{CommittedItem, Period};
use crate::error::AppResult;
use crate::metrics;
use crate::models::{
    Booking, BookingItem, BookingStatus, Inventory, InventoryStatus, Invoice, InvoiceStatus,
    Payment, Quote, QuoteStatus, Waiver,
};
use crate::store::{BookingStore, BookingTx};

// -----------------------------------------------------------------------------
// COLUMN LISTS
// -----------------------------------------------------------------------------
const INVENTORY_COLUMNS: &str =
    r#"id, business_id, name, "type", price, quantity, status, created_at, updated_at"#;

const BOOKING_COLUMNS: &str = "id, business_id, customer_id, event_date, start_time, end_time, \
    timezone, event_address, event_city, event_state, event_zip, participant_count, status, \
    subtotal_amount, tax_rate_bps, tax_amount, total_amount, expires_at, coupon_id, invoice_id, \
    quote_id, created_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, booking_id, inventory_id, quantity, price, start_utc, end_utc, booking_status, created_at";

/// Business id the demo inventory is seeded under
pub const DEMO_BUSINESS_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0001);

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Apply the embedded migrations in `./migrations`.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(())
    }

    /// Seed a demo inventory under `DEMO_BUSINESS_ID` (idempotent)
    pub async fn seed_demo_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inventory WHERE business_id = $1")
            .bind(DEMO_BUSINESS_ID)
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        // (name, type, price in cents, units)
        let demo_items = [
            ("Castle-A", "bounce_house", 25_000_i64, 1),
            ("Castle-B", "bounce_house", 22_500, 2),
            ("Tropical Slide", "water_slide", 35_000, 1),
            ("Obstacle Course 40ft", "obstacle_course", 45_000, 1),
            ("Dunk Tank", "game", 20_000, 1),
            ("Table & 8 Chairs", "furniture", 1_500, 20),
        ];

        for (name, kind, price, quantity) in demo_items {
            sqlx::query(
                r#"
                INSERT INTO inventory (id, business_id, name, "type", price, quantity, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(DEMO_BUSINESS_ID)
            .bind(name)
            .bind(kind)
            .bind(price)
            .bind(quantity)
            .bind(InventoryStatus::Available)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(business_id = %DEMO_BUSINESS_ID, "Seeded demo inventory");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // READ OPERATIONS
    // -------------------------------------------------------------------------

    /// All inventory types of a business, by name
    pub async fn list_inventory(&self, business_id: Uuid) -> AppResult<Vec<Inventory>> {
        let start = Instant::now();
        let items = sqlx::query_as::<_, Inventory>(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE business_id = $1 ORDER BY name ASC"
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        metrics::record_db_query("list_inventory", start.elapsed().as_secs_f64());
        Ok(items)
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    /// Check if database connection is healthy
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================
pub struct PgBookingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BookingStore for Database {
    type Tx = PgBookingTx;

    async fn begin(&self) -> AppResult<PgBookingTx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        Ok(PgBookingTx { tx })
    }
}

/// Row shape of the committed-items query
#[derive(FromRow)]
struct CommittedRow {
    inventory_id: Uuid,
    quantity: i32,
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
}

#[async_trait]
impl BookingTx for PgBookingTx {
    async fn load_inventory(&mut self, business_id: Uuid, ids: &[Uuid]) -> AppResult<Vec<Inventory>> {
        let rows = sqlx::query_as::<_, Inventory>(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE business_id = $1 AND id = ANY($2)"
        ))
        .bind(business_id)
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }

    async fn committed_items(
        &mut self,
        inventory_ids: &[Uuid],
        window: Period,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CommittedItem>> {
        let start = Instant::now();
        let rows = sqlx::query_as::<_, CommittedRow>(
            r#"
            SELECT bi.inventory_id, bi.quantity, bi.start_utc, bi.end_utc
            FROM booking_items bi
            JOIN bookings b ON b.id = bi.booking_id
            WHERE bi.inventory_id = ANY($1)
              AND bi.period && tstzrange($2, $3, '[]')
              AND bi.booking_status <> 'CANCELLED'
              AND b.status <> 'CANCELLED'
              AND NOT (b.status = 'HOLD' AND b.expires_at <= $4)
            "#,
        )
        .bind(inventory_ids)
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;

        metrics::record_db_query("committed_items", start.elapsed().as_secs_f64());

        Ok(rows
            .into_iter()
            .map(|row| CommittedItem {
                inventory_id: row.inventory_id,
                quantity: row.quantity,
                period: Period {
                    start: row.start_utc,
                    end: row.end_utc,
                },
            })
            .collect())
    }

    async fn find_booking(&mut self, business_id: Uuid, booking_id: Uuid) -> AppResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 AND business_id = $2"
        ))
        .bind(booking_id)
        .bind(business_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(booking)
    }

    async fn find_booking_for_update(
        &mut self,
        business_id: Uuid,
        booking_id: Uuid,
    ) -> AppResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 AND business_id = $2 FOR UPDATE"
        ))
        .bind(booking_id)
        .bind(business_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(booking)
    }

    async fn expired_holds(&mut self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings \
             WHERE status = 'HOLD' AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(bookings)
    }

    async fn insert_booking(&mut self, booking: &Booking) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO bookings ({BOOKING_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20, $21, $22, $23)"
        ))
        .bind(booking.id)
        .bind(booking.business_id)
        .bind(booking.customer_id)
        .bind(booking.event_date)
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(&booking.timezone)
        .bind(&booking.event_address)
        .bind(&booking.event_city)
        .bind(&booking.event_state)
        .bind(&booking.event_zip)
        .bind(booking.participant_count)
        .bind(booking.status)
        .bind(booking.subtotal_amount)
        .bind(booking.tax_rate_bps)
        .bind(booking.tax_amount)
        .bind(booking.total_amount)
        .bind(booking.expires_at)
        .bind(booking.coupon_id)
        .bind(booking.invoice_id)
        .bind(booking.quote_id)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_booking(&mut self, booking: &Booking) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE bookings SET
                customer_id = $2, event_date = $3, start_time = $4, end_time = $5,
                timezone = $6, event_address = $7, event_city = $8, event_state = $9,
                event_zip = $10, participant_count = $11, status = $12,
                subtotal_amount = $13, tax_rate_bps = $14, tax_amount = $15,
                total_amount = $16, expires_at = $17, coupon_id = $18,
                invoice_id = $19, quote_id = $20, updated_at = $21
            WHERE id = $1
            "#,
        )
        .bind(booking.id)
        .bind(booking.customer_id)
        .bind(booking.event_date)
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(&booking.timezone)
        .bind(&booking.event_address)
        .bind(&booking.event_city)
        .bind(&booking.event_state)
        .bind(&booking.event_zip)
        .bind(booking.participant_count)
        .bind(booking.status)
        .bind(booking.subtotal_amount)
        .bind(booking.tax_rate_bps)
        .bind(booking.tax_amount)
        .bind(booking.total_amount)
        .bind(booking.expires_at)
        .bind(booking.coupon_id)
        .bind(booking.invoice_id)
        .bind(booking.quote_id)
        .bind(booking.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn booking_items(&mut self, booking_id: Uuid) -> AppResult<Vec<BookingItem>> {
        let items = sqlx::query_as::<_, BookingItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM booking_items WHERE booking_id = $1 ORDER BY created_at, id"
        ))
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(items)
    }

    async fn insert_items(&mut self, items: &[BookingItem]) -> AppResult<()> {
        for item in items {
            sqlx::query(&format!(
                "INSERT INTO booking_items ({ITEM_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(item.id)
            .bind(item.booking_id)
            .bind(item.inventory_id)
            .bind(item.quantity)
            .bind(item.price)
            .bind(item.start_utc)
            .bind(item.end_utc)
            .bind(item.booking_status)
            .bind(item.created_at)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn delete_items(&mut self, booking_id: Uuid, item_ids: &[Uuid]) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM booking_items WHERE booking_id = $1 AND id = ANY($2)")
            .bind(booking_id)
            .bind(item_ids)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn set_items_status(
        &mut self,
        booking_id: Uuid,
        item_ids: &[Uuid],
        status: BookingStatus,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE booking_items SET booking_status = $3 WHERE booking_id = $1 AND id = ANY($2)",
        )
        .bind(booking_id)
        .bind(item_ids)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn invoice(&mut self, invoice_id: Uuid) -> AppResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, business_id, booking_id, stripe_invoice_id, status, amount,
                   created_at, updated_at
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(invoice)
    }

    async fn quote(&mut self, quote_id: Uuid) -> AppResult<Option<Quote>> {
        let quote = sqlx::query_as::<_, Quote>(
            r#"
            SELECT id, business_id, booking_id, stripe_quote_id, status, amount,
                   created_at, updated_at
            FROM quotes
            WHERE id = $1
            "#,
        )
        .bind(quote_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(quote)
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (id, business_id, booking_id, stripe_invoice_id, status, amount,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.business_id)
        .bind(invoice.booking_id)
        .bind(&invoice.stripe_invoice_id)
        .bind(invoice.status)
        .bind(invoice.amount)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_quote(&mut self, quote: &Quote) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quotes (id, business_id, booking_id, stripe_quote_id, status, amount,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(quote.id)
        .bind(quote.business_id)
        .bind(quote.booking_id)
        .bind(&quote.stripe_quote_id)
        .bind(quote.status)
        .bind(quote.amount)
        .bind(quote.created_at)
        .bind(quote.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE invoices SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(invoice_id)
            .bind(status)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn set_quote_status(
        &mut self,
        quote_id: Uuid,
        status: QuoteStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE quotes SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(quote_id)
            .bind(status)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn payments(&mut self, booking_id: Uuid) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, business_id, booking_id, stripe_payment_intent_id, amount, status, created_at
            FROM payments
            WHERE booking_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(payments)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, business_id, booking_id, stripe_payment_intent_id, amount,
                                  status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(payment.id)
        .bind(payment.business_id)
        .bind(payment.booking_id)
        .bind(&payment.stripe_payment_intent_id)
        .bind(payment.amount)
        .bind(payment.status)
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_waiver(&mut self, waiver: &Waiver) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO waivers (id, business_id, booking_id, signer_name, signed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(waiver.id)
        .bind(waiver.business_id)
        .bind(waiver.booking_id)
        .bind(&waiver.signer_name)
        .bind(waiver.signed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self) -> AppResult<()> {
        let start = Instant::now();
        self.tx.commit().await?;
        metrics::record_db_query("commit", start.elapsed().as_secs_f64());
        Ok(())
    }
}
