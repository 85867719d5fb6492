use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;

use super::*;
use crate::store::IntervalStore;

fn d(m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, day).unwrap()
}

fn span(a: NaiveDate, b: NaiveDate) -> DateSpan {
    DateSpan::new(a, b).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("loaner_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn guest(first: &str) -> Guest {
    Guest {
        first_name: first.into(),
        last_name: "Lovelace".into(),
        email: format!("{}@example.com", first.to_lowercase()),
        phone: "555-0100".into(),
    }
}

fn new_reservation(item_id: ItemId, s: DateSpan) -> NewReservation {
    NewReservation {
        guest: guest("Ada"),
        item_id,
        span: s,
    }
}

#[tokio::test]
async fn items_are_listed_by_name() {
    let store = LocalStore::in_memory();
    store.add_item("ThinkPad X1").await.unwrap();
    store.add_item("Dell XPS").await.unwrap();
    store.add_item("MacBook Air").await.unwrap();
    let names: Vec<_> = store.items().await.unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["Dell XPS", "MacBook Air", "ThinkPad X1"]);
}

#[tokio::test]
async fn add_item_rejects_blank_and_oversized_names() {
    let store = LocalStore::in_memory();
    assert!(matches!(store.add_item("   ").await, Err(Error::Validation(_))));
    let long = "x".repeat(crate::limits::MAX_ITEM_NAME_LEN + 1);
    assert!(matches!(store.add_item(&long).await, Err(Error::Validation(_))));
}

#[tokio::test]
async fn unknown_item_is_not_found() {
    let store = LocalStore::in_memory();
    let err = store.item(9).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { entity: "item", id: 9 }));
    let err = store
        .restrictions_for_item_in_range(9, DateSpan::day(d(6, 1)))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn empty_item_is_free() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let free = store.items_free_in_range(span(d(6, 1), d(6, 3))).await.unwrap();
    assert_eq!(free, vec![item]);
}

#[tokio::test]
async fn single_day_block_occupies_only_that_day() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    store
        .insert_restriction(NewRestriction::block(item.id, d(6, 2)))
        .await
        .unwrap();

    let hit = store
        .restrictions_for_item_in_range(item.id, DateSpan::day(d(6, 2)))
        .await
        .unwrap();
    assert_eq!(hit.len(), 1);
    let miss = store
        .restrictions_for_item_in_range(item.id, span(d(6, 3), d(6, 4)))
        .await
        .unwrap();
    assert!(miss.is_empty());
}

#[tokio::test]
async fn boundary_date_counts_as_overlap() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    store
        .commit_booking(new_reservation(item.id, span(d(6, 1), d(6, 5))))
        .await
        .unwrap();

    let touching = store
        .restrictions_for_item_in_range(item.id, span(d(6, 5), d(6, 6)))
        .await
        .unwrap();
    assert_eq!(touching.len(), 1);
    let err = store
        .commit_booking(new_reservation(item.id, span(d(6, 5), d(6, 6))))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    store
        .commit_booking(new_reservation(item.id, span(d(6, 6), d(6, 7))))
        .await
        .unwrap();
}

#[tokio::test]
async fn reservation_roundtrip_keeps_fields() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let new = new_reservation(item.id, span(d(6, 10), d(6, 12)));
    let id = store.insert_reservation(new.clone()).await.unwrap();

    let fetched = store.reservation(id).await.unwrap();
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.guest, new.guest);
    assert_eq!(fetched.item_id, new.item_id);
    assert_eq!(fetched.span, new.span);
    assert!(!fetched.processed);
}

#[tokio::test]
async fn commit_is_visible_to_next_read() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let booking = store
        .commit_booking(new_reservation(item.id, span(d(6, 1), d(6, 3))))
        .await
        .unwrap();

    let restrictions = store
        .restrictions_for_item_in_range(item.id, span(d(6, 1), d(6, 30)))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 1);
    assert_eq!(restrictions[0].id, booking.restriction_id);
    assert_eq!(restrictions[0].reservation_id, Some(booking.reservation_id));
    assert_eq!(restrictions[0].kind, RestrictionKind::Reservation);
    assert!(store.items_free_in_range(DateSpan::day(d(6, 2))).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_bookings_for_same_range_exactly_one_wins() {
    let store = Arc::new(LocalStore::in_memory());
    let item = store.add_item("MacBook").await.unwrap();
    let s = span(d(6, 1), d(6, 3));

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .commit_booking(NewReservation {
                    guest: guest(&format!("Guest{i}")),
                    item_id: item.id,
                    span: s,
                })
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(store.reservations(ReservationFilter::All).await.unwrap().len(), 1);
}

#[tokio::test]
async fn losing_booking_leaves_no_orphan_reservation() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    store
        .insert_restriction(NewRestriction::block(item.id, d(6, 2)))
        .await
        .unwrap();
    let err = store
        .commit_booking(new_reservation(item.id, span(d(6, 1), d(6, 3))))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(store.reservations(ReservationFilter::All).await.unwrap().is_empty());
}

#[tokio::test]
async fn reservation_restrictions_cannot_double_book() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let s = span(d(6, 1), d(6, 3));
    let a = store.insert_reservation(new_reservation(item.id, s)).await.unwrap();
    let b = store.insert_reservation(new_reservation(item.id, s)).await.unwrap();
    store
        .insert_restriction(NewRestriction::for_reservation(item.id, s, a))
        .await
        .unwrap();
    let err = store
        .insert_restriction(NewRestriction::for_reservation(item.id, s, b))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Manual blocks may stack on top of anything.
    store
        .insert_restriction(NewRestriction::block(item.id, d(6, 2)))
        .await
        .unwrap();
}

#[tokio::test]
async fn restriction_must_reference_reservation_on_same_item() {
    let store = LocalStore::in_memory();
    let a = store.add_item("MacBook").await.unwrap();
    let b = store.add_item("ThinkPad").await.unwrap();
    let s = DateSpan::day(d(6, 1));
    let rid = store.insert_reservation(new_reservation(a.id, s)).await.unwrap();

    let err = store
        .insert_restriction(NewRestriction::for_reservation(b.id, s, rid))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = store
        .insert_restriction(NewRestriction::for_reservation(a.id, s, 999))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_reservation_cascades_to_restrictions() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let s = span(d(6, 1), d(6, 3));
    let booking = store.commit_booking(new_reservation(item.id, s)).await.unwrap();
    let block = store
        .insert_restriction(NewRestriction::block(item.id, d(6, 20)))
        .await
        .unwrap();

    store.delete_reservation(booking.reservation_id).await.unwrap();

    assert!(store.reservation(booking.reservation_id).await.unwrap_err().is_not_found());
    let left = store
        .restrictions_for_item_in_range(item.id, span(d(6, 1), d(6, 30)))
        .await
        .unwrap();
    assert_eq!(left.iter().map(|r| r.id).collect::<Vec<_>>(), vec![block]);
    assert!(store.delete_restriction(booking.restriction_id).await.unwrap_err().is_not_found());
    assert!(store.delete_reservation(booking.reservation_id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn update_and_process_reservation() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let booking = store
        .commit_booking(new_reservation(item.id, DateSpan::day(d(6, 1))))
        .await
        .unwrap();
    let id = booking.reservation_id;

    store.update_reservation(id, guest("Grace")).await.unwrap();
    store.update_reservation_processed(id, true).await.unwrap();

    let r = store.reservation(id).await.unwrap();
    assert_eq!(r.guest.first_name, "Grace");
    assert!(r.processed);
    assert!(r.updated_at >= r.created_at);
    assert!(store.reservations(ReservationFilter::Unprocessed).await.unwrap().is_empty());
    assert!(store.update_reservation_processed(77, true).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn reservations_ordered_by_start_then_end() {
    let store = LocalStore::in_memory();
    let item = store.add_item("MacBook").await.unwrap();
    let late = store
        .insert_reservation(new_reservation(item.id, span(d(7, 1), d(7, 2))))
        .await
        .unwrap();
    let long = store
        .insert_reservation(new_reservation(item.id, span(d(6, 1), d(6, 9))))
        .await
        .unwrap();
    let short = store
        .insert_reservation(new_reservation(item.id, span(d(6, 1), d(6, 2))))
        .await
        .unwrap();
    let ids: Vec<_> = store
        .reservations(ReservationFilter::All)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![short, long, late]);
}

// ── Journal ──────────────────────────────────────────────

#[tokio::test]
async fn journal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (item_id, booking, block) = {
        let store = LocalStore::open(&path).unwrap();
        let item = store.add_item("MacBook").await.unwrap();
        let booking = store
            .commit_booking(new_reservation(item.id, span(d(6, 1), d(6, 3))))
            .await
            .unwrap();
        let block = store
            .insert_restriction(NewRestriction::block(item.id, d(6, 10)))
            .await
            .unwrap();
        store.update_reservation_processed(booking.reservation_id, true).await.unwrap();
        (item.id, booking, block)
    };

    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.item(item_id).await.unwrap().name, "MacBook");
    assert!(store.reservation(booking.reservation_id).await.unwrap().processed);
    let ids: Vec<_> = store
        .restrictions_for_item_in_range(item_id, span(d(6, 1), d(6, 30)))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![booking.restriction_id, block]);

    // Ids keep counting past what the journal already used.
    let next = store
        .insert_restriction(NewRestriction::block(item_id, d(6, 11)))
        .await
        .unwrap();
    assert!(next > block);
}

#[tokio::test]
async fn compaction_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let (item_id, keep) = {
        let store = LocalStore::open(&path).unwrap();
        let item = store.add_item("MacBook").await.unwrap();
        for day in 1..=20 {
            let id = store
                .insert_restriction(NewRestriction::block(item.id, d(6, day)))
                .await
                .unwrap();
            store.delete_restriction(id).await.unwrap();
        }
        let keep = store
            .commit_booking(new_reservation(item.id, span(d(6, 1), d(6, 2))))
            .await
            .unwrap();
        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        store
            .insert_restriction(NewRestriction::block(item.id, d(6, 25)))
            .await
            .unwrap();
        (item.id, keep)
    };

    let store = LocalStore::open(&path).unwrap();
    let restrictions = store
        .restrictions_for_item_in_range(item_id, span(d(6, 1), d(6, 30)))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 2);
    assert_eq!(restrictions[0].reservation_id, Some(keep.reservation_id));
    assert!(restrictions[1].is_block());
    assert_eq!(store.reservations(ReservationFilter::All).await.unwrap().len(), 1);
}

#[tokio::test]
async fn appends_counter_tracks_and_resets() {
    let path = test_wal_path("appends_counter.wal");
    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.appends_since_compact().await, 0);

    let item = store.add_item("MacBook").await.unwrap();
    let id = store
        .insert_restriction(NewRestriction::block(item.id, d(6, 1)))
        .await
        .unwrap();
    store.delete_restriction(id).await.unwrap();
    assert_eq!(store.appends_since_compact().await, 3);

    store.compact().await.unwrap();
    assert_eq!(store.appends_since_compact().await, 0);
}

#[tokio::test]
async fn group_commit_handles_concurrent_appends() {
    let path = test_wal_path("group_commit.wal");
    let store = Arc::new(LocalStore::open(&path).unwrap());
    let item = store.add_item("MacBook").await.unwrap();

    let mut handles = Vec::new();
    for day in 1..=20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert_restriction(NewRestriction::block(item.id, d(6, day)))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    drop(store);

    let reopened = LocalStore::open(&path).unwrap();
    let restrictions = reopened
        .restrictions_for_item_in_range(item.id, span(d(6, 1), d(6, 30)))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_during_writes_keeps_every_acknowledged_write() {
    let path = test_wal_path("compact_under_load.wal");
    let store = Arc::new(LocalStore::open(&path).unwrap());
    let item = store.add_item("MacBook").await.unwrap();
    let first = d(1, 1);

    let compactor = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                store.compact().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let mut writers = Vec::new();
    for task in 0..8u64 {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..28u64 {
                let day = first + chrono::Days::new(task * 28 + i);
                store
                    .insert_restriction(NewRestriction::block(item.id, day))
                    .await
                    .unwrap();
            }
        }));
    }
    for w in writers {
        w.await.unwrap();
    }
    compactor.await.unwrap();
    drop(store);

    let reopened = LocalStore::open(&path).unwrap();
    let all = span(first, first + chrono::Days::new(8 * 28));
    let restrictions = reopened.restrictions_for_item_in_range(item.id, all).await.unwrap();
    assert_eq!(restrictions.len(), 8 * 28);
}

#[tokio::test]
async fn journal_has_a_single_writer() {
    let path = test_wal_path("single_writer.wal");
    let store = LocalStore::open(&path).unwrap();
    let err = LocalStore::open(&path).err().expect("second open must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    let item = store.add_item("MacBook").await.unwrap();
    drop(store);

    let reopened = LocalStore::open(&path).unwrap();
    assert_eq!(reopened.item(item.id).await.unwrap().name, "MacBook");
}

#[tokio::test]
async fn in_memory_store_has_no_journal() {
    let store = LocalStore::in_memory();
    assert!(store.journal_path().is_none());
    store.compact().await.unwrap();
    assert_eq!(store.appends_since_compact().await, 0);
}
