use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_capacity, check_no_double_booking, check_range_free};
use super::LocalStore;

impl LocalStore {
    /// Provision a catalog entry. Items are never renamed or removed.
    pub async fn add_item(&self, name: &str) -> Result<Item> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("item name is required"));
        }
        if name.len() > MAX_ITEM_NAME_LEN {
            return Err(Error::validation("item name too long"));
        }
        let _gate = self.mutation_gate().await;
        if self.items.len() >= MAX_ITEMS {
            return Err(Error::persistence("add_item", "catalog is full"));
        }

        let now = Utc::now();
        let item = Item {
            id: self.next_item_id(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.wal_append(&Event::ItemAdded { item: item.clone() }).await?;
        self.items
            .insert(item.id, Arc::new(RwLock::new(ItemState::new(item.clone()))));
        info!(item_id = item.id, name = %item.name, "item added");
        Ok(item)
    }

    pub(super) async fn put_reservation(&self, new: NewReservation) -> Result<ReservationId> {
        let _gate = self.mutation_gate().await;
        let state = self.item_state(new.item_id)?;
        let mut guard = state.write().await;

        let now = Utc::now();
        let reservation = Reservation {
            id: self.next_reservation_id(),
            guest: new.guest,
            item_id: new.item_id,
            span: new.span,
            processed: false,
            created_at: now,
            updated_at: now,
        };
        let id = reservation.id;
        self.persist_and_apply(&mut guard, &Event::ReservationInserted { reservation })
            .await?;
        Ok(id)
    }

    pub(super) async fn put_restriction(&self, new: NewRestriction) -> Result<RestrictionId> {
        match (new.kind, new.reservation_id) {
            (RestrictionKind::Reservation, None) => {
                return Err(Error::validation("reservation restriction needs a reservation id"));
            }
            (RestrictionKind::Block, Some(_)) => {
                return Err(Error::validation("manual block cannot reference a reservation"));
            }
            _ => {}
        }
        let _gate = self.mutation_gate().await;
        let state = self.item_state(new.item_id)?;
        let mut guard = state.write().await;
        check_capacity(&guard, "insert_restriction")?;

        if let Some(rid) = new.reservation_id {
            let owner_item = self
                .reservations
                .get(&rid)
                .map(|r| r.item_id)
                .ok_or(Error::NotFound { entity: "reservation", id: rid })?;
            if owner_item != new.item_id {
                return Err(Error::validation(format!(
                    "reservation {rid} belongs to item {owner_item}, not {}",
                    new.item_id
                )));
            }
        }
        if new.kind == RestrictionKind::Reservation {
            check_no_double_booking(&guard, &new.span)?;
        }

        let restriction = Restriction {
            id: self.next_restriction_id(),
            item_id: new.item_id,
            span: new.span,
            reservation_id: new.reservation_id,
            kind: new.kind,
        };
        let id = restriction.id;
        self.persist_and_apply(&mut guard, &Event::RestrictionAdded { restriction })
            .await?;
        debug!(restriction_id = id, item_id = new.item_id, span = %new.span, "restriction added");
        Ok(id)
    }

    /// Check, journal and apply under one hold of the item's write lock.
    /// Two bookings racing for the same item serialize here.
    pub(super) async fn book(&self, new: NewReservation) -> Result<Booking> {
        let _gate = self.mutation_gate().await;
        let state = self.item_state(new.item_id)?;
        let mut guard = state.write().await;
        check_range_free(&guard, &new.span)?;
        check_capacity(&guard, "commit_booking")?;

        let now = Utc::now();
        let reservation = Reservation {
            id: self.next_reservation_id(),
            guest: new.guest,
            item_id: new.item_id,
            span: new.span,
            processed: false,
            created_at: now,
            updated_at: now,
        };
        let restriction = Restriction {
            id: self.next_restriction_id(),
            item_id: new.item_id,
            span: new.span,
            reservation_id: Some(reservation.id),
            kind: RestrictionKind::Reservation,
        };
        let booking = Booking {
            reservation_id: reservation.id,
            restriction_id: restriction.id,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::ReservationBooked {
                reservation,
                restriction,
            },
        )
        .await?;
        info!(
            reservation_id = booking.reservation_id,
            item_id = new.item_id,
            span = %new.span,
            "booking committed"
        );
        Ok(booking)
    }

    fn reservation_item(&self, id: ReservationId) -> Result<ItemId> {
        self.reservations
            .get(&id)
            .map(|r| r.item_id)
            .ok_or(Error::NotFound { entity: "reservation", id })
    }

    /// Reservation ids never move between items, so the item found before
    /// locking is still the right one; existence is re-checked under the lock.
    pub(super) async fn set_guest(&self, id: ReservationId, guest: Guest) -> Result<()> {
        let item_id = self.reservation_item(id)?;
        let _gate = self.mutation_gate().await;
        let state = self.item_state(item_id)?;
        let mut guard = state.write().await;
        self.reservation_item(id)?;
        let event = Event::ReservationUpdated {
            id,
            item_id,
            guest,
            updated_at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub(super) async fn set_processed(&self, id: ReservationId, processed: bool) -> Result<()> {
        let item_id = self.reservation_item(id)?;
        let _gate = self.mutation_gate().await;
        let state = self.item_state(item_id)?;
        let mut guard = state.write().await;
        self.reservation_item(id)?;
        let event = Event::ReservationProcessed {
            id,
            item_id,
            processed,
            updated_at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub(super) async fn remove_reservation(&self, id: ReservationId) -> Result<()> {
        let item_id = self.reservation_item(id)?;
        let _gate = self.mutation_gate().await;
        let state = self.item_state(item_id)?;
        let mut guard = state.write().await;
        self.reservation_item(id)?;
        self.persist_and_apply(&mut guard, &Event::ReservationDeleted { id, item_id })
            .await?;
        info!(reservation_id = id, item_id, "reservation deleted");
        Ok(())
    }

    pub(super) async fn remove_restriction(&self, id: RestrictionId) -> Result<()> {
        let item_id = self
            .restriction_to_item
            .get(&id)
            .map(|e| *e.value())
            .ok_or(Error::NotFound { entity: "restriction", id })?;
        let _gate = self.mutation_gate().await;
        let state = self.item_state(item_id)?;
        let mut guard = state.write().await;
        if !guard.restrictions.iter().any(|r| r.id == id) {
            return Err(Error::NotFound { entity: "restriction", id });
        }
        self.persist_and_apply(&mut guard, &Event::RestrictionRemoved { id, item_id })
            .await
    }
}
