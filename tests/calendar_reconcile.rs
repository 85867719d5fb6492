use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use loaner::calendar::{BlockSubmission, Calendar, Month, day_key};
use loaner::config::Config;
use loaner::handlers::{App, Form, Outcome};
use loaner::mail::MailQueue;
use loaner::model::*;
use loaner::session::SessionStore;
use loaner::store::{IntervalStore, LocalStore};

fn journal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("loaner_cal_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("loaner.wal")
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
}

fn august() -> DateSpan {
    Month::new(2025, 8).unwrap().span()
}

async fn blocks(store: &dyn IntervalStore, item_id: ItemId) -> Vec<NaiveDate> {
    store
        .restrictions_for_item_in_range(item_id, august())
        .await
        .unwrap()
        .into_iter()
        .filter(Restriction::is_block)
        .map(|r| r.span.start)
        .collect()
}

#[tokio::test]
async fn admin_calendar_round_trip_through_journal() {
    let path = journal_path();
    let (laptop, reservation_id) = {
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let laptop = store.add_item("Framework 13").await.unwrap();
        let booking = store
            .commit_booking(NewReservation {
                guest: Guest {
                    first_name: "Ada".into(),
                    last_name: "Lovelace".into(),
                    email: "ada@example.com".into(),
                    phone: String::new(),
                },
                item_id: laptop.id,
                span: DateSpan::new(d(10), d(12)).unwrap(),
            })
            .await
            .unwrap();
        store.insert_restriction(NewRestriction::block(laptop.id, d(1))).await.unwrap();
        store.insert_restriction(NewRestriction::block(laptop.id, d(2))).await.unwrap();

        let sessions = Arc::new(SessionStore::new(Duration::from_secs(600)));
        let (mail, _mail_rx) = MailQueue::new(4);
        let app = App::new(store.clone(), sessions, mail, &Config::default());
        let sid = app.sessions.create();

        let out = app
            .reservations_calendar(sid, &[("y", "2025"), ("m", "8")].into_iter().collect())
            .await;
        assert!(matches!(out, Outcome::Render { .. }));

        // Keep the 2nd, drop the 1st, add the 20th.
        let mut form = Form::default();
        form.set("y", "2025");
        form.set("m", "8");
        form.set(format!("remove_block_{}_{}", laptop.id, day_key(d(2))), "on");
        form.set(format!("add_block_{}_{}", laptop.id, day_key(d(20))), "on");
        let out = app.post_reservations_calendar(sid, &form).await;
        assert_eq!(out.location(), Some("/admin/reservations-calendar?y=2025&m=8"));
        assert_eq!(blocks(store.as_ref(), laptop.id).await, vec![d(2), d(20)]);

        (laptop, booking.reservation_id)
    };

    let store = Arc::new(LocalStore::open(&path).unwrap());
    assert_eq!(blocks(store.as_ref(), laptop.id).await, vec![d(2), d(20)]);
    assert!(store.reservation(reservation_id).await.is_ok());

    // Nothing kept, nothing added: every block in the month goes, the
    // reservation stays.
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(600)));
    let calendar = Calendar::new(store.clone(), sessions.clone());
    let sid = sessions.create();
    let month = Month::new(2025, 8).unwrap();
    calendar.render_month(sid, month).await.unwrap();
    let report = calendar
        .reconcile(sid, month, &BlockSubmission::default())
        .await
        .unwrap();
    assert_eq!(report.removed, 2);
    assert!(blocks(store.as_ref(), laptop.id).await.is_empty());
    let busy = store.restrictions_for_item_in_range(laptop.id, august()).await.unwrap();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].reservation_id, Some(reservation_id));
}

#[tokio::test]
async fn second_admin_tab_sees_fresh_blocks() {
    let store = Arc::new(LocalStore::in_memory());
    let laptop = store.add_item("Pinebook Pro").await.unwrap();
    store.insert_restriction(NewRestriction::block(laptop.id, d(5))).await.unwrap();

    let sessions = Arc::new(SessionStore::new(Duration::from_secs(600)));
    let calendar = Calendar::new(store.clone(), sessions.clone());
    let month = Month::new(2025, 8).unwrap();
    let (first, second) = (sessions.create(), sessions.create());
    calendar.render_month(first, month).await.unwrap();
    calendar.render_month(second, month).await.unwrap();

    // First tab drops the block; second tab, rendered before that, also
    // drops it. The second pass finds nothing left to delete.
    let one = calendar.reconcile(first, month, &BlockSubmission::default()).await.unwrap();
    let two = calendar.reconcile(second, month, &BlockSubmission::default()).await.unwrap();
    assert_eq!(one.removed, 1);
    assert_eq!(two.removed, 0);
    assert_eq!(two.skipped, 1);
    assert!(blocks(store.as_ref(), laptop.id).await.is_empty());
}
