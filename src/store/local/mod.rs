mod conflict;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use fs4::fs_std::FileExt;
use tokio::sync::{RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::wal::Wal;

use super::IntervalStore;

pub type SharedItemState = Arc<RwLock<ItemState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal and batches appends: block for the first append, drain
/// whatever else is already queued, fsync once, answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

#[derive(Debug, Default)]
struct IdSequence(AtomicI64);

impl IdSequence {
    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make sure ids handed out later are above `seen`.
    fn observe(&self, seen: i64) {
        self.0.fetch_max(seen, Ordering::SeqCst);
    }
}

/// In-process interval store. Optionally durable through a journal.
///
/// Each item's restrictions sit behind their own `RwLock`; every write to an
/// item's busy time holds that lock across check, journal append and apply.
pub struct LocalStore {
    pub(super) items: DashMap<ItemId, SharedItemState>,
    pub(super) reservations: DashMap<ReservationId, Reservation>,
    /// Reverse lookup: restriction id → item id.
    pub(super) restriction_to_item: DashMap<RestrictionId, ItemId>,
    item_ids: IdSequence,
    reservation_ids: IdSequence,
    restriction_ids: IdSequence,
    /// Shared by every mutation from before its checks until it is applied;
    /// held exclusively by compaction from snapshot to swap.
    compaction: RwLock<()>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    path: Option<PathBuf>,
    /// Exclusive advisory lock marking this process as the journal's writer.
    _lock: Option<File>,
}

impl LocalStore {
    fn empty(
        wal_tx: Option<mpsc::Sender<WalCommand>>,
        path: Option<PathBuf>,
        lock: Option<File>,
    ) -> Self {
        Self {
            items: DashMap::new(),
            reservations: DashMap::new(),
            restriction_to_item: DashMap::new(),
            item_ids: IdSequence::default(),
            reservation_ids: IdSequence::default(),
            restriction_ids: IdSequence::default(),
            compaction: RwLock::new(()),
            wal_tx,
            path,
            _lock: lock,
        }
    }

    /// Volatile store, nothing touches disk. Used as the test fixture.
    pub fn in_memory() -> Self {
        Self::empty(None, None, None)
    }

    /// Durable store: replays the journal at `path`, then appends to it.
    /// Only one store may have a journal open at a time; a second opener,
    /// in this process or another, fails with `WouldBlock`.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let lock = lock_journal(path)?;
        let replay = Wal::replay(path)?;
        if replay.truncated {
            warn!(path = %path.display(), "journal had a torn tail, discarded it");
        }
        let wal = Wal::open(path, replay.events.len() as u64)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self::empty(Some(wal_tx), Some(path.to_path_buf()), Some(lock));
        for event in &replay.events {
            store.replay_event(event);
        }
        info!(
            path = %path.display(),
            events = replay.events.len(),
            items = store.items.len(),
            reservations = store.reservations.len(),
            "journal replayed"
        );
        Ok(store)
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ItemAdded { item } => {
                self.item_ids.observe(item.id);
                self.items
                    .insert(item.id, Arc::new(RwLock::new(ItemState::new(item.clone()))));
            }
            other => {
                let Some(item_id) = event_item_id(other) else { return };
                let Some(state) = self.get_item(item_id) else {
                    warn!(item_id, "journal references unknown item, skipping record");
                    return;
                };
                // Sole owner during replay: the lock is uncontended.
                let Ok(mut guard) = state.try_write() else { return };
                self.apply(&mut guard, other);
            }
        }
    }

    pub(super) fn get_item(&self, id: ItemId) -> Option<SharedItemState> {
        self.items.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn item_state(&self, id: ItemId) -> Result<SharedItemState> {
        self.get_item(id).ok_or(Error::NotFound { entity: "item", id })
    }

    pub(super) fn next_reservation_id(&self) -> ReservationId {
        self.reservation_ids.next()
    }

    pub(super) fn next_restriction_id(&self) -> RestrictionId {
        self.restriction_ids.next()
    }

    pub(super) fn next_item_id(&self) -> ItemId {
        self.item_ids.next()
    }

    /// Apply an event to an item's state. Caller holds the item's write lock.
    pub(super) fn apply(&self, state: &mut ItemState, event: &Event) {
        match event {
            Event::ItemAdded { .. } => {}
            Event::ReservationInserted { reservation } => {
                self.reservation_ids.observe(reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationBooked {
                reservation,
                restriction,
            } => {
                self.reservation_ids.observe(reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
                self.index_restriction(state, restriction.clone());
            }
            Event::ReservationUpdated {
                id,
                guest,
                updated_at,
                ..
            } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.guest = guest.clone();
                    r.updated_at = *updated_at;
                }
            }
            Event::ReservationProcessed {
                id,
                processed,
                updated_at,
                ..
            } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.processed = *processed;
                    r.updated_at = *updated_at;
                }
            }
            Event::ReservationDeleted { id, .. } => {
                self.reservations.remove(id);
                for rid in state.remove_owned_by(*id) {
                    self.restriction_to_item.remove(&rid);
                }
            }
            Event::RestrictionAdded { restriction } => {
                self.index_restriction(state, restriction.clone());
            }
            Event::RestrictionRemoved { id, .. } => {
                state.remove_restriction(*id);
                self.restriction_to_item.remove(id);
            }
        }
    }

    fn index_restriction(&self, state: &mut ItemState, restriction: Restriction) {
        self.restriction_ids.observe(restriction.id);
        self.restriction_to_item.insert(restriction.id, restriction.item_id);
        state.insert_restriction(restriction);
    }

    async fn wal_append(&self, event: &Event) -> Result<()> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| Error::persistence("journal_append", "journal writer shut down"))?;
        rx.await
            .map_err(|_| Error::persistence("journal_append", "journal writer dropped response"))?
            .map_err(|e| Error::persistence("journal_append", e))
    }

    /// Journal first, then apply. A failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(&self, state: &mut ItemState, event: &Event) -> Result<()> {
        self.wal_append(event).await?;
        self.apply(state, event);
        Ok(())
    }

    /// Held for the whole of a mutation, before any item lock is taken.
    pub(super) async fn mutation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction.read().await
    }

    /// Rewrite the journal as the minimal event list recreating current state.
    /// Mutations wait until the compacted journal is in place, so nothing
    /// acknowledged after the snapshot is lost to the swap.
    pub async fn compact(&self) -> Result<()> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.compaction.write().await;
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| Error::persistence("journal_compact", "journal writer shut down"))?;
        rx.await
            .map_err(|_| Error::persistence("journal_compact", "journal writer dropped response"))?
            .map_err(|e| Error::persistence("journal_compact", e))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut item_ids: Vec<ItemId> = self.items.iter().map(|e| *e.key()).collect();
        item_ids.sort_unstable();

        let mut items = Vec::with_capacity(item_ids.len());
        let mut restrictions = Vec::new();
        for id in item_ids {
            let Some(state) = self.get_item(id) else { continue };
            let guard = state.read().await;
            items.push(Event::ItemAdded {
                item: guard.item.clone(),
            });
            restrictions.extend(guard.restrictions.iter().cloned().map(|restriction| {
                Event::RestrictionAdded { restriction }
            }));
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);

        items
            .into_iter()
            .chain(reservations.into_iter().map(|reservation| Event::ReservationInserted { reservation }))
            .chain(restrictions)
            .collect()
    }
}

#[async_trait]
impl IntervalStore for LocalStore {
    async fn items(&self) -> Result<Vec<Item>> {
        Ok(self.catalog().await)
    }

    async fn item(&self, id: ItemId) -> Result<Item> {
        self.lookup_item(id).await
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId> {
        self.put_reservation(new).await
    }

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId> {
        self.put_restriction(new).await
    }

    async fn commit_booking(&self, new: NewReservation) -> Result<Booking> {
        self.book(new).await
    }

    async fn restrictions_for_item_in_range(
        &self,
        item_id: ItemId,
        span: DateSpan,
    ) -> Result<Vec<Restriction>> {
        self.item_restrictions(item_id, span).await
    }

    async fn items_free_in_range(&self, span: DateSpan) -> Result<Vec<Item>> {
        Ok(self.free_items(span).await)
    }

    async fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.lookup_reservation(id)
    }

    async fn reservations(&self, filter: ReservationFilter) -> Result<Vec<Reservation>> {
        Ok(self.list_reservations(filter))
    }

    async fn update_reservation(&self, id: ReservationId, guest: Guest) -> Result<()> {
        self.set_guest(id, guest).await
    }

    async fn update_reservation_processed(&self, id: ReservationId, processed: bool) -> Result<()> {
        self.set_processed(id, processed).await
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<()> {
        self.remove_reservation(id).await
    }

    async fn delete_restriction(&self, id: RestrictionId) -> Result<()> {
        self.remove_restriction(id).await
    }
}

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("wal.lock")
}

/// Take the writer lock beside the journal. The lock lives on a separate
/// file because compaction renames a new file over the journal itself.
fn lock_journal(path: &Path) -> io::Result<File> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("journal {} is already open elsewhere: {e}", path.display()),
        )
    })?;
    Ok(file)
}

/// Item an event belongs to. `None` for catalog additions.
fn event_item_id(event: &Event) -> Option<ItemId> {
    match event {
        Event::ItemAdded { .. } => None,
        Event::ReservationInserted { reservation } | Event::ReservationBooked { reservation, .. } => {
            Some(reservation.item_id)
        }
        Event::RestrictionAdded { restriction } => Some(restriction.item_id),
        Event::ReservationUpdated { item_id, .. }
        | Event::ReservationProcessed { item_id, .. }
        | Event::ReservationDeleted { item_id, .. }
        | Event::RestrictionRemoved { item_id, .. } => Some(*item_id),
    }
}
