//! Month view of every item's busy days, and reconciliation of the manual
//! blocks an administrator toggles on it.
//!
//! Rendering caches each item's day → block id map in the session under
//! `block_map_<item_id>`. Reconciliation starts from that cache but checks it
//! against the store's current blocks before deleting anything, so a block
//! already gone or an id that now names a reservation is skipped, never touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::limits::MAX_CALENDAR_DIRECTIVES;
use crate::model::*;
use crate::observability::{CALENDAR_BLOCKS_ADDED_TOTAL, CALENDAR_BLOCKS_REMOVED_TOTAL};
use crate::session::{SessionId, SessionStore};
use crate::store::IntervalStore;

/// Day → restriction or reservation id, zero for a free day.
pub type DayMap = BTreeMap<NaiveDate, i64>;

/// Date format used inside calendar form field names: month padded, day not.
pub const DAY_KEY_FORMAT: &str = "%Y-%m-%-d";

pub fn day_key(date: NaiveDate) -> String {
    date.format(DAY_KEY_FORMAT).to_string()
}

pub fn parse_day_key(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

pub fn block_map_key(item_id: ItemId) -> String {
    format!("block_map_{item_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        let complete = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|first| first.checked_add_months(Months::new(1)))
            .is_some();
        if !complete {
            return Err(Error::validation(format!("no such month: {year}-{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// From the `y` and `m` query or form values.
    pub fn parse(year: &str, month: &str) -> Result<Self> {
        let year = year
            .trim()
            .parse()
            .map_err(|_| Error::validation("can't get year"))?;
        let month = month
            .trim()
            .parse()
            .map_err(|_| Error::validation("can't get month"))?;
        Self::new(year, month)
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.first_day()
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn span(&self) -> DateSpan {
        DateSpan {
            start: self.first_day(),
            end: self.last_day(),
        }
    }

    pub fn days_in_month(&self) -> u32 {
        self.last_day().day()
    }

    pub fn next(&self) -> Self {
        self.shift(|d| d.checked_add_months(Months::new(1)))
    }

    pub fn previous(&self) -> Self {
        self.shift(|d| d.checked_sub_months(Months::new(1)))
    }

    fn shift(&self, f: impl Fn(NaiveDate) -> Option<NaiveDate>) -> Self {
        f(self.first_day()).map(Self::containing).unwrap_or(*self)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCalendar {
    pub item: Item,
    pub reservations: DayMap,
    pub blocks: DayMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMonth {
    pub month: Month,
    pub previous: Month,
    pub next: Month,
    pub days_in_month: u32,
    pub items: Vec<ItemCalendar>,
}

/// Add and keep directives parsed from a calendar form post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSubmission {
    pub add: BTreeSet<(ItemId, NaiveDate)>,
    pub keep: BTreeSet<(ItemId, NaiveDate)>,
}

impl BlockSubmission {
    /// Only field names matter; `add_block_<item>_<day>` asks for a new
    /// block, `remove_block_<item>_<day>` keeps an existing one. Anything
    /// else in the form is ignored.
    pub fn from_fields<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut submission = Self::default();
        for name in names {
            let (set, rest) = if let Some(rest) = name.strip_prefix("add_block_") {
                (&mut submission.add, rest)
            } else if let Some(rest) = name.strip_prefix("remove_block_") {
                (&mut submission.keep, rest)
            } else {
                continue;
            };
            set.insert(parse_directive(name, rest)?);
            if submission.add.len() + submission.keep.len() > MAX_CALENDAR_DIRECTIVES {
                return Err(Error::validation("too many calendar changes in one submission"));
            }
        }
        Ok(submission)
    }

    pub fn keeps(&self, item_id: ItemId, date: NaiveDate) -> bool {
        self.keep.contains(&(item_id, date))
    }
}

fn parse_directive(name: &str, rest: &str) -> Result<(ItemId, NaiveDate)> {
    let malformed = || Error::validation(format!("malformed calendar field {name:?}"));
    let (item, day) = rest.split_once('_').ok_or_else(malformed)?;
    let item_id: ItemId = item.parse().map_err(|_| malformed())?;
    if item_id <= 0 {
        return Err(malformed());
    }
    let date = parse_day_key(day).ok_or_else(malformed)?;
    Ok((item_id, date))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub removed: usize,
    pub added: usize,
    /// Cached blocks already gone, and add directives for days already
    /// blocked or outside the month.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Calendar {
    store: Arc<dyn IntervalStore>,
    sessions: Arc<SessionStore>,
}

impl Calendar {
    pub fn new(store: Arc<dyn IntervalStore>, sessions: Arc<SessionStore>) -> Self {
        Self { store, sessions }
    }

    pub async fn render_month(&self, session: SessionId, month: Month) -> Result<CalendarMonth> {
        let window = month.span();
        let empty: DayMap = window.days().map(|d| (d, 0)).collect();

        let catalog = self.store.items().await?;
        let busy = try_join_all(
            catalog
                .iter()
                .map(|item| self.store.restrictions_for_item_in_range(item.id, window)),
        )
        .await?;

        let mut items = Vec::with_capacity(catalog.len());
        for (item, restrictions) in catalog.into_iter().zip(busy) {
            let mut reservations = empty.clone();
            let mut blocks = empty.clone();
            for r in restrictions {
                let Some(visible) = r.span.clamp_to(&window) else { continue };
                let (map, id) = match r.reservation_id {
                    Some(rid) => (&mut reservations, rid),
                    None => (&mut blocks, r.id),
                };
                for day in visible.days() {
                    map.insert(day, id);
                }
            }
            self.sessions.put(session, &block_map_key(item.id), &blocks)?;
            items.push(ItemCalendar {
                item,
                reservations,
                blocks,
            });
        }

        Ok(CalendarMonth {
            month,
            previous: month.previous(),
            next: month.next(),
            days_in_month: month.days_in_month(),
            items,
        })
    }

    /// Apply a calendar submission. Stops at the first failed write; writes
    /// made before it are kept.
    pub async fn reconcile(
        &self,
        session: SessionId,
        month: Month,
        submission: &BlockSubmission,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let result = self.reconcile_into(session, month, submission, &mut report).await;
        metrics::counter!(CALENDAR_BLOCKS_REMOVED_TOTAL).increment(report.removed as u64);
        metrics::counter!(CALENDAR_BLOCKS_ADDED_TOTAL).increment(report.added as u64);
        match result {
            Ok(()) => {
                info!(%month, removed = report.removed, added = report.added, skipped = report.skipped, "calendar saved");
                Ok(report)
            }
            Err(e) => {
                warn!(%month, removed = report.removed, added = report.added, "calendar save stopped part way: {e}");
                Err(e)
            }
        }
    }

    async fn reconcile_into(
        &self,
        session: SessionId,
        month: Month,
        submission: &BlockSubmission,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let window = month.span();
        // Days that will still carry a manual block once this pass is done.
        let mut blocked: HashMap<ItemId, BTreeSet<NaiveDate>> = HashMap::new();

        for item in self.store.items().await? {
            let cached: DayMap = self
                .sessions
                .get(session, &block_map_key(item.id))?
                .unwrap_or_default();

            let live: HashMap<RestrictionId, DateSpan> = self
                .store
                .restrictions_for_item_in_range(item.id, window)
                .await?
                .into_iter()
                .filter(Restriction::is_block)
                .map(|r| (r.id, r.span))
                .collect();
            let mut doomed = BTreeSet::new();

            for (&date, &rid) in &cached {
                if rid <= 0 || submission.keeps(item.id, date) || !doomed.insert(rid) {
                    continue;
                }
                if !live.contains_key(&rid) {
                    report.skipped += 1;
                    continue;
                }
                match self.store.delete_restriction(rid).await {
                    Ok(()) => report.removed += 1,
                    Err(e) if e.is_not_found() => report.skipped += 1,
                    Err(e) => return Err(e),
                }
            }

            let days = blocked.entry(item.id).or_default();
            for (rid, span) in &live {
                if !doomed.contains(rid) {
                    days.extend(span.days());
                }
            }
        }

        for &(item_id, date) in &submission.add {
            if !window.contains(date) {
                warn!(%month, item_id, %date, "add directive outside the month skipped");
                report.skipped += 1;
                continue;
            }
            let days = blocked.entry(item_id).or_default();
            if days.contains(&date) {
                report.skipped += 1;
                continue;
            }
            self.store
                .insert_restriction(NewRestriction::block(item_id, date))
                .await?;
            days.insert(date);
            report.added += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use std::time::Duration;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    struct Fixture {
        store: Arc<LocalStore>,
        calendar: Calendar,
        sessions: Arc<SessionStore>,
        sid: SessionId,
        item: ItemId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let item = store.add_item("MacBook").await.unwrap().id;
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
        let sid = sessions.create();
        let calendar = Calendar::new(store.clone(), sessions.clone());
        Fixture {
            store,
            calendar,
            sessions,
            sid,
            item,
        }
    }

    async fn block_days(f: &Fixture) -> Vec<NaiveDate> {
        let june = Month::new(2025, 6).unwrap();
        let mut days: Vec<_> = f
            .store
            .restrictions_for_item_in_range(f.item, june.span())
            .await
            .unwrap()
            .into_iter()
            .filter(Restriction::is_block)
            .map(|r| r.span.start)
            .collect();
        days.sort();
        days
    }

    #[test]
    fn day_key_pads_month_not_day() {
        assert_eq!(day_key(d(2)), "2025-06-2");
        assert_eq!(day_key(d(21)), "2025-06-21");
        assert_eq!(parse_day_key("2025-06-2"), Some(d(2)));
    }

    #[test]
    fn month_navigation_wraps_years() {
        let jan = Month::new(2025, 1).unwrap();
        assert_eq!(jan.previous(), Month::new(2024, 12).unwrap());
        assert_eq!(Month::new(2024, 12).unwrap().next(), jan);
        assert_eq!(Month::new(2024, 2).unwrap().days_in_month(), 29);
        assert!(Month::new(2025, 13).is_err());
        assert!(Month::parse("2025", "x").is_err());
    }

    #[test]
    fn last_representable_month_is_rejected() {
        let last = NaiveDate::MAX.year();
        assert!(Month::new(last, 12).is_err());
        assert!(Month::parse(&last.to_string(), "12").is_err());

        let november = Month::new(last, 11).unwrap();
        assert_eq!(november.days_in_month(), 30);
        let span = november.span();
        assert!(span.start <= span.end);

        let edge = Month::containing(NaiveDate::MAX).span();
        assert!(edge.start <= edge.end);
        assert_eq!(edge.end, NaiveDate::MAX);
    }

    #[test]
    fn submission_parsing() {
        let s = BlockSubmission::from_fields([
            "add_block_1_2025-06-3",
            "remove_block_1_2025-06-12",
            "csrf_token",
            "y",
        ])
        .unwrap();
        assert!(s.add.contains(&(1, d(3))));
        assert!(s.keeps(1, d(12)));
        assert!(!s.keeps(1, d(3)));

        assert!(BlockSubmission::from_fields(["add_block_x_2025-06-3"]).is_err());
        assert!(BlockSubmission::from_fields(["add_block_1_2025-13-3"]).is_err());
        assert!(BlockSubmission::from_fields(["remove_block_1"]).is_err());
    }

    #[tokio::test]
    async fn render_fills_maps_and_caches_blocks() {
        let f = fixture().await;
        let block = f
            .store
            .insert_restriction(NewRestriction::block(f.item, d(4)))
            .await
            .unwrap();
        let booking = f
            .store
            .commit_booking(NewReservation {
                guest: Guest::default(),
                item_id: f.item,
                span: DateSpan::new(d(29), NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()).unwrap(),
            })
            .await
            .unwrap();

        let view = f
            .calendar
            .render_month(f.sid, Month::new(2025, 6).unwrap())
            .await
            .unwrap();
        let cal = &view.items[0];
        assert_eq!(cal.blocks.len(), 30);
        assert_eq!(cal.blocks[&d(4)], block);
        assert_eq!(cal.blocks[&d(5)], 0);
        assert_eq!(cal.reservations[&d(30)], booking.reservation_id);
        assert_eq!(cal.reservations[&d(28)], 0);

        let cached: DayMap = f.sessions.get(f.sid, &block_map_key(f.item)).unwrap().unwrap();
        assert_eq!(cached, cal.blocks);
    }

    #[tokio::test]
    async fn unkept_blocks_are_all_removed() {
        let f = fixture().await;
        for day in [2, 9, 16] {
            f.store
                .insert_restriction(NewRestriction::block(f.item, d(day)))
                .await
                .unwrap();
        }
        let june = Month::new(2025, 6).unwrap();
        f.calendar.render_month(f.sid, june).await.unwrap();

        let report = f
            .calendar
            .reconcile(f.sid, june, &BlockSubmission::default())
            .await
            .unwrap();
        assert_eq!(report.removed, 3);
        assert!(block_days(&f).await.is_empty());
    }

    #[tokio::test]
    async fn resubmitting_same_form_changes_nothing() {
        let f = fixture().await;
        f.store
            .insert_restriction(NewRestriction::block(f.item, d(2)))
            .await
            .unwrap();
        f.store
            .insert_restriction(NewRestriction::block(f.item, d(9)))
            .await
            .unwrap();
        let june = Month::new(2025, 6).unwrap();
        f.calendar.render_month(f.sid, june).await.unwrap();

        let add = format!("add_block_{}_2025-06-20", f.item);
        let keep = format!("remove_block_{}_2025-06-9", f.item);
        let submission = BlockSubmission::from_fields([add.as_str(), keep.as_str()]).unwrap();

        f.calendar.reconcile(f.sid, june, &submission).await.unwrap();
        let once = block_days(&f).await;
        assert_eq!(once, vec![d(9), d(20)]);

        let again = f.calendar.reconcile(f.sid, june, &submission).await.unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(again.added, 0);
        assert_eq!(block_days(&f).await, once);
    }

    #[tokio::test]
    async fn add_outside_rendered_month_is_skipped() {
        let f = fixture().await;
        let june = Month::new(2025, 6).unwrap();
        f.calendar.render_month(f.sid, june).await.unwrap();

        let add = format!("add_block_{}_2025-07-5", f.item);
        let submission = BlockSubmission::from_fields([add.as_str()]).unwrap();
        for _ in 0..2 {
            let report = f.calendar.reconcile(f.sid, june, &submission).await.unwrap();
            assert_eq!(report.added, 0);
            assert_eq!(report.skipped, 1);
        }

        let july = Month::new(2025, 7).unwrap();
        let july_blocks = f
            .store
            .restrictions_for_item_in_range(f.item, july.span())
            .await
            .unwrap();
        assert!(july_blocks.is_empty());
    }

    #[tokio::test]
    async fn stale_cache_never_touches_reservations() {
        let f = fixture().await;
        let june = Month::new(2025, 6).unwrap();
        let block = f
            .store
            .insert_restriction(NewRestriction::block(f.item, d(3)))
            .await
            .unwrap();
        f.calendar.render_month(f.sid, june).await.unwrap();

        // Block removed elsewhere, then the day gets booked.
        f.store.delete_restriction(block).await.unwrap();
        let booking = f
            .store
            .commit_booking(NewReservation {
                guest: Guest::default(),
                item_id: f.item,
                span: DateSpan::day(d(3)),
            })
            .await
            .unwrap();

        let report = f
            .calendar
            .reconcile(f.sid, june, &BlockSubmission::default())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert!(f.store.reservation(booking.reservation_id).await.is_ok());
    }

    #[tokio::test]
    async fn missing_session_map_means_nothing_to_remove() {
        let f = fixture().await;
        f.store
            .insert_restriction(NewRestriction::block(f.item, d(2)))
            .await
            .unwrap();
        let report = f
            .calendar
            .reconcile(f.sid, Month::new(2025, 6).unwrap(), &BlockSubmission::default())
            .await
            .unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(block_days(&f).await, vec![d(2)]);
    }

    #[tokio::test]
    async fn add_for_unknown_item_stops_the_pass() {
        let f = fixture().await;
        let submission = BlockSubmission::from_fields(["add_block_99_2025-06-2"]).unwrap();
        let err = f
            .calendar
            .reconcile(f.sid, Month::new(2025, 6).unwrap(), &submission)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
