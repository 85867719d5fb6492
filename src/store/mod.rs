//! Durable record of items, reservations and restrictions.
//!
//! Every mutation of busy time goes through [`IntervalStore`]; nothing else
//! writes restrictions, so overlap detection lives in one place.

pub mod local;
pub mod postgres;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::*;

pub use local::LocalStore;
pub use postgres::PgStore;

#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Whole catalog, ordered by display name.
    async fn items(&self) -> Result<Vec<Item>>;

    async fn item(&self, id: ItemId) -> Result<Item>;

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId>;

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId>;

    /// Re-check the range and write the reservation plus its restriction as
    /// one unit. Fails with `Conflict` if any restriction intersects the span.
    async fn commit_booking(&self, new: NewReservation) -> Result<Booking>;

    /// Restrictions on `item_id` intersecting `span`, ordered by start date then id.
    async fn restrictions_for_item_in_range(
        &self,
        item_id: ItemId,
        span: DateSpan,
    ) -> Result<Vec<Restriction>>;

    /// Items with no restriction intersecting `span`, ordered by display name.
    async fn items_free_in_range(&self, span: DateSpan) -> Result<Vec<Item>>;

    async fn reservation(&self, id: ReservationId) -> Result<Reservation>;

    /// Ordered by start date, end date, id.
    async fn reservations(&self, filter: ReservationFilter) -> Result<Vec<Reservation>>;

    async fn update_reservation(&self, id: ReservationId, guest: Guest) -> Result<()>;

    async fn update_reservation_processed(&self, id: ReservationId, processed: bool) -> Result<()>;

    /// Deletes the reservation and every restriction referencing it.
    async fn delete_reservation(&self, id: ReservationId) -> Result<()>;

    async fn delete_restriction(&self, id: RestrictionId) -> Result<()>;
}

/// Deadline and metrics decorator over any backend. Holds the backend
/// behind an `Arc` so callers can keep a typed handle for maintenance work.
pub struct Timed<S: ?Sized> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S: IntervalStore + ?Sized> Timed<S> {
    pub fn new(inner: Arc<S>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    async fn run<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL, "op" => op)
                    .increment(1);
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(Error::persistence(
                    op,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ))
            }
        };
        metrics::histogram!(crate::observability::STORE_OP_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        if let Err(Error::Persistence { .. }) = &result {
            metrics::counter!(crate::observability::STORE_OP_ERRORS_TOTAL, "op" => op).increment(1);
        }
        result
    }
}

#[async_trait]
impl<S: IntervalStore + ?Sized> IntervalStore for Timed<S> {
    async fn items(&self) -> Result<Vec<Item>> {
        self.run("items", self.inner.items()).await
    }

    async fn item(&self, id: ItemId) -> Result<Item> {
        self.run("item", self.inner.item(id)).await
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId> {
        self.run("insert_reservation", self.inner.insert_reservation(new)).await
    }

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId> {
        self.run("insert_restriction", self.inner.insert_restriction(new)).await
    }

    async fn commit_booking(&self, new: NewReservation) -> Result<Booking> {
        self.run("commit_booking", self.inner.commit_booking(new)).await
    }

    async fn restrictions_for_item_in_range(
        &self,
        item_id: ItemId,
        span: DateSpan,
    ) -> Result<Vec<Restriction>> {
        self.run(
            "restrictions_for_item_in_range",
            self.inner.restrictions_for_item_in_range(item_id, span),
        )
        .await
    }

    async fn items_free_in_range(&self, span: DateSpan) -> Result<Vec<Item>> {
        self.run("items_free_in_range", self.inner.items_free_in_range(span)).await
    }

    async fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.run("reservation", self.inner.reservation(id)).await
    }

    async fn reservations(&self, filter: ReservationFilter) -> Result<Vec<Reservation>> {
        self.run("reservations", self.inner.reservations(filter)).await
    }

    async fn update_reservation(&self, id: ReservationId, guest: Guest) -> Result<()> {
        self.run("update_reservation", self.inner.update_reservation(id, guest)).await
    }

    async fn update_reservation_processed(&self, id: ReservationId, processed: bool) -> Result<()> {
        self.run(
            "update_reservation_processed",
            self.inner.update_reservation_processed(id, processed),
        )
        .await
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<()> {
        self.run("delete_reservation", self.inner.delete_reservation(id)).await
    }

    async fn delete_restriction(&self, id: RestrictionId) -> Result<()> {
        self.run("delete_restriction", self.inner.delete_restriction(id)).await
    }
}
