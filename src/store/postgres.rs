//! PostgreSQL backend.
//!
//! Parameterized queries only. Bookings lock the item row for the length of
//! the transaction, and the `laptop_restrictions_no_double_booking`
//! exclusion constraint refuses overlapping reservation-kind rows even if a
//! writer skips the lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::*;

use super::IntervalStore;

/// Embedded migrations under `migrations/`.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

const EXCLUSION_VIOLATION: &str = "23P01";

/// Map a driver error to the crate taxonomy. Callers with more context
/// (which item, which span) check for conflicts before falling back here.
fn db_error(op: &'static str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::PoolTimedOut => Error::persistence(op, "timed out waiting for a connection"),
        sqlx::Error::RowNotFound => Error::persistence(op, "statement returned no row"),
        sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
            Error::validation(db_err.message().to_string())
        }
        _ => Error::persistence(op, err),
    }
}

fn is_exclusion_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(EXCLUSION_VIOLATION))
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: i64,
    laptop_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: row.id,
            name: row.laptop_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: i64,
    first_name: String,
    last_name: String,
    email: String,
    phone: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    laptop_id: i64,
    processed: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ReservationRow> for Reservation {
    fn from(row: ReservationRow) -> Self {
        Reservation {
            id: row.id,
            guest: Guest {
                first_name: row.first_name,
                last_name: row.last_name,
                email: row.email,
                phone: row.phone,
            },
            item_id: row.laptop_id,
            span: DateSpan {
                start: row.start_date,
                end: row.end_date,
            },
            processed: row.processed != 0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RestrictionRow {
    id: i64,
    start_date: NaiveDate,
    end_date: NaiveDate,
    laptop_id: i64,
    reservation_id: Option<i64>,
    restriction_id: i16,
}

impl TryFrom<RestrictionRow> for Restriction {
    type Error = Error;

    fn try_from(row: RestrictionRow) -> Result<Self> {
        let kind = RestrictionKind::from_code(i32::from(row.restriction_id)).ok_or_else(|| {
            Error::persistence(
                "decode_restriction",
                format!("unknown restriction kind {} on row {}", row.restriction_id, row.id),
            )
        })?;
        Ok(Restriction {
            id: row.id,
            item_id: row.laptop_id,
            span: DateSpan {
                start: row.start_date,
                end: row.end_date,
            },
            reservation_id: row.reservation_id,
            kind,
        })
    }
}

const RESERVATION_COLUMNS: &str = "id, first_name, last_name, email, phone, start_date, end_date, \
                                   laptop_id, processed, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| db_error("connect", e))?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        migrator()
            .run(&self.pool)
            .await
            .map_err(|e| Error::persistence("migrate", e))
    }

    /// Catalog provisioning. Not part of the booking surface.
    pub async fn add_item(&self, name: &str) -> Result<Item> {
        let name = name.trim();
        if name.is_empty() || name.len() > crate::limits::MAX_ITEM_NAME_LEN {
            return Err(Error::validation("item name must be 1 to 255 characters"));
        }
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            INSERT INTO laptops (laptop_name) VALUES ($1)
            RETURNING id, laptop_name, created_at, updated_at
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("add_item", e))?;
        Ok(row.into())
    }

    async fn begin(&self, op: &'static str) -> Result<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(|e| db_error(op, e))
    }

    /// Take the item row lock. Every writer of an item's restrictions goes
    /// through here first, so they queue behind each other.
    async fn lock_item(tx: &mut Transaction<'_, Postgres>, op: &'static str, item_id: ItemId) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM laptops WHERE id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| db_error(op, e))?
            .ok_or(Error::NotFound { entity: "item", id: item_id })?;
        Ok(())
    }

    async fn overlaps(
        tx: &mut Transaction<'_, Postgres>,
        op: &'static str,
        item_id: ItemId,
        span: DateSpan,
        only_kind: Option<RestrictionKind>,
    ) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM laptop_restrictions
                WHERE laptop_id = $1
                  AND end_date >= $2
                  AND start_date <= $3
                  AND ($4::smallint IS NULL OR restriction_id = $4)
            )
            "#,
        )
        .bind(item_id)
        .bind(span.start)
        .bind(span.end)
        .bind(only_kind.map(|k| k.code() as i16))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| db_error(op, e))
    }

    async fn insert_reservation_row(
        tx: &mut Transaction<'_, Postgres>,
        op: &'static str,
        new: &NewReservation,
    ) -> Result<ReservationId> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO reservations (first_name, last_name, email, phone, start_date, end_date, laptop_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&new.guest.first_name)
        .bind(&new.guest.last_name)
        .bind(&new.guest.email)
        .bind(&new.guest.phone)
        .bind(new.span.start)
        .bind(new.span.end)
        .bind(new.item_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                Error::NotFound { entity: "item", id: new.item_id }
            } else {
                db_error(op, e)
            }
        })
    }

    async fn insert_restriction_row(
        tx: &mut Transaction<'_, Postgres>,
        op: &'static str,
        new: &NewRestriction,
    ) -> Result<RestrictionId> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO laptop_restrictions (start_date, end_date, laptop_id, reservation_id, restriction_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(new.span.start)
        .bind(new.span.end)
        .bind(new.item_id)
        .bind(new.reservation_id)
        .bind(new.kind.code() as i16)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_exclusion_violation(&e) {
                Error::Conflict { item_id: new.item_id, span: new.span }
            } else {
                db_error(op, e)
            }
        })
    }

    async fn item_exists(&self, op: &'static str, item_id: ItemId) -> Result<()> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM laptops WHERE id = $1)")
            .bind(item_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error(op, e))?;
        if !exists {
            return Err(Error::NotFound { entity: "item", id: item_id });
        }
        Ok(())
    }
}

#[async_trait]
impl IntervalStore for PgStore {
    async fn items(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT id, laptop_name, created_at, updated_at FROM laptops ORDER BY laptop_name, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("items", e))?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn item(&self, id: ItemId) -> Result<Item> {
        sqlx::query_as::<_, ItemRow>("SELECT id, laptop_name, created_at, updated_at FROM laptops WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("item", e))?
            .map(Item::from)
            .ok_or(Error::NotFound { entity: "item", id })
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId> {
        let mut tx = self.begin("insert_reservation").await?;
        let id = Self::insert_reservation_row(&mut tx, "insert_reservation", &new).await?;
        tx.commit().await.map_err(|e| db_error("insert_reservation", e))?;
        Ok(id)
    }

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId> {
        const OP: &str = "insert_restriction";
        match (new.kind, new.reservation_id) {
            (RestrictionKind::Reservation, None) => {
                return Err(Error::validation("reservation restriction needs a reservation id"));
            }
            (RestrictionKind::Block, Some(_)) => {
                return Err(Error::validation("manual block cannot reference a reservation"));
            }
            _ => {}
        }

        let mut tx = self.begin(OP).await?;
        Self::lock_item(&mut tx, OP, new.item_id).await?;
        if let Some(rid) = new.reservation_id {
            let owner = sqlx::query_scalar::<_, i64>("SELECT laptop_id FROM reservations WHERE id = $1")
                .bind(rid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error(OP, e))?
                .ok_or(Error::NotFound { entity: "reservation", id: rid })?;
            if owner != new.item_id {
                return Err(Error::validation(format!(
                    "reservation {rid} belongs to item {owner}, not {}",
                    new.item_id
                )));
            }
        }
        if new.kind == RestrictionKind::Reservation
            && Self::overlaps(&mut tx, OP, new.item_id, new.span, Some(RestrictionKind::Reservation)).await?
        {
            return Err(Error::Conflict { item_id: new.item_id, span: new.span });
        }
        let id = Self::insert_restriction_row(&mut tx, OP, &new).await?;
        tx.commit().await.map_err(|e| db_error(OP, e))?;
        Ok(id)
    }

    /// Re-check and both inserts in one transaction. Dropping `tx` on any
    /// early return rolls everything back.
    async fn commit_booking(&self, new: NewReservation) -> Result<Booking> {
        const OP: &str = "commit_booking";
        let mut tx = self.begin(OP).await?;
        Self::lock_item(&mut tx, OP, new.item_id).await?;
        if Self::overlaps(&mut tx, OP, new.item_id, new.span, None).await? {
            return Err(Error::Conflict { item_id: new.item_id, span: new.span });
        }

        let reservation_id = Self::insert_reservation_row(&mut tx, OP, &new).await?;
        let restriction = NewRestriction::for_reservation(new.item_id, new.span, reservation_id);
        let restriction_id = Self::insert_restriction_row(&mut tx, OP, &restriction).await?;
        tx.commit().await.map_err(|e| {
            if is_exclusion_violation(&e) {
                Error::Conflict { item_id: new.item_id, span: new.span }
            } else {
                db_error(OP, e)
            }
        })?;

        info!(reservation_id, item_id = new.item_id, span = %new.span, "booking committed");
        Ok(Booking {
            reservation_id,
            restriction_id,
        })
    }

    async fn restrictions_for_item_in_range(&self, item_id: ItemId, span: DateSpan) -> Result<Vec<Restriction>> {
        const OP: &str = "restrictions_for_item_in_range";
        self.item_exists(OP, item_id).await?;
        let rows = sqlx::query_as::<_, RestrictionRow>(
            r#"
            SELECT id, start_date, end_date, laptop_id, reservation_id, restriction_id
            FROM laptop_restrictions
            WHERE laptop_id = $1 AND end_date >= $2 AND start_date <= $3
            ORDER BY start_date, id
            "#,
        )
        .bind(item_id)
        .bind(span.start)
        .bind(span.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error(OP, e))?;
        rows.into_iter().map(Restriction::try_from).collect()
    }

    async fn items_free_in_range(&self, span: DateSpan) -> Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT l.id, l.laptop_name, l.created_at, l.updated_at
            FROM laptops l
            WHERE NOT EXISTS (
                SELECT 1 FROM laptop_restrictions lr
                WHERE lr.laptop_id = l.id AND lr.end_date >= $1 AND lr.start_date <= $2
            )
            ORDER BY l.laptop_name, l.id
            "#,
        )
        .bind(span.start)
        .bind(span.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("items_free_in_range", e))?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("reservation", e))?
        .map(Reservation::from)
        .ok_or(Error::NotFound { entity: "reservation", id })
    }

    async fn reservations(&self, filter: ReservationFilter) -> Result<Vec<Reservation>> {
        let only_new = matches!(filter, ReservationFilter::Unprocessed);
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE (NOT $1 OR processed = 0) \
             ORDER BY start_date, end_date, id"
        ))
        .bind(only_new)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("reservations", e))?;
        Ok(rows.into_iter().map(Reservation::from).collect())
    }

    async fn update_reservation(&self, id: ReservationId, guest: Guest) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET first_name = $1, last_name = $2, email = $3, phone = $4, updated_at = now()
            WHERE id = $5
            "#,
        )
        .bind(&guest.first_name)
        .bind(&guest.last_name)
        .bind(&guest.email)
        .bind(&guest.phone)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update_reservation", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { entity: "reservation", id });
        }
        Ok(())
    }

    async fn update_reservation_processed(&self, id: ReservationId, processed: bool) -> Result<()> {
        let result = sqlx::query("UPDATE reservations SET processed = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(i32::from(processed))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("update_reservation_processed", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { entity: "reservation", id });
        }
        Ok(())
    }

    /// Owned restrictions go with it through `ON DELETE CASCADE`.
    async fn delete_reservation(&self, id: ReservationId) -> Result<()> {
        let result = sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_reservation", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { entity: "reservation", id });
        }
        Ok(())
    }

    async fn delete_restriction(&self, id: RestrictionId) -> Result<()> {
        let result = sqlx::query("DELETE FROM laptop_restrictions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_restriction", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { entity: "restriction", id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    #[test]
    fn restriction_row_decodes_kind() {
        let row = RestrictionRow {
            id: 3,
            start_date: d(2),
            end_date: d(2),
            laptop_id: 1,
            reservation_id: None,
            restriction_id: 2,
        };
        let r = Restriction::try_from(row).unwrap();
        assert!(r.is_block());
        assert_eq!(r.span, DateSpan::day(d(2)));
    }

    #[test]
    fn unknown_kind_is_persistence_error() {
        let row = RestrictionRow {
            id: 3,
            start_date: d(2),
            end_date: d(2),
            laptop_id: 1,
            reservation_id: None,
            restriction_id: 9,
        };
        assert!(matches!(Restriction::try_from(row), Err(Error::Persistence { .. })));
    }

    #[test]
    fn processed_integer_maps_to_flag() {
        let now = Utc::now();
        let row = ReservationRow {
            id: 1,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            phone: String::new(),
            start_date: d(1),
            end_date: d(3),
            laptop_id: 2,
            processed: 1,
            created_at: now,
            updated_at: now,
        };
        let r = Reservation::from(row);
        assert!(r.processed);
        assert_eq!(r.item_id, 2);
        assert_eq!(r.span.len_days(), 3);
    }

    #[test]
    fn driver_errors_classified() {
        let err = db_error("items", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::Persistence { op: "items", .. }));
        let err = db_error("item", sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(!is_exclusion_violation(&sqlx::Error::PoolClosed));
    }
}
