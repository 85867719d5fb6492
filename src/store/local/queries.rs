use crate::error::{Error, Result};
use crate::model::*;

use super::LocalStore;

impl LocalStore {
    pub(super) async fn catalog(&self) -> Vec<Item> {
        let states: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut items = Vec::with_capacity(states.len());
        for state in states {
            items.push(state.read().await.item.clone());
        }
        sort_by_name(&mut items);
        items
    }

    pub(super) async fn lookup_item(&self, id: ItemId) -> Result<Item> {
        let state = self.item_state(id)?;
        let guard = state.read().await;
        Ok(guard.item.clone())
    }

    pub(super) async fn item_restrictions(
        &self,
        item_id: ItemId,
        span: DateSpan,
    ) -> Result<Vec<Restriction>> {
        let state = self.item_state(item_id)?;
        let guard = state.read().await;
        Ok(guard.overlapping(&span).cloned().collect())
    }

    /// Each item is judged under its own read lock; the answer is a snapshot
    /// and may be stale by the time the caller acts on it.
    pub(super) async fn free_items(&self, span: DateSpan) -> Vec<Item> {
        let states: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut free = Vec::new();
        for state in states {
            let guard = state.read().await;
            if guard.is_free(&span) {
                free.push(guard.item.clone());
            }
        }
        sort_by_name(&mut free);
        free
    }

    pub(super) fn lookup_reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(Error::NotFound { entity: "reservation", id })
    }

    pub(super) fn list_reservations(&self, filter: ReservationFilter) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| match filter {
                ReservationFilter::All => true,
                ReservationFilter::Unprocessed => !r.processed,
            })
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.span.end, r.id));
        out
    }
}

fn sort_by_name(items: &mut [Item]) {
    items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}
