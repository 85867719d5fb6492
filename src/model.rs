use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type ItemId = i64;
pub type ReservationId = i64;
pub type RestrictionId = i64;

/// Closed interval of calendar dates `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDateSpan")]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateSpan {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateSpan> for DateSpan {
    type Error = Error;

    fn try_from(raw: RawDateSpan) -> Result<Self> {
        DateSpan::new(raw.start, raw.end)
    }
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::validation(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Number of calendar days covered, both ends included.
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: sharing a single boundary date counts.
    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Intersection of two spans, `None` when disjoint.
    pub fn clamp_to(&self, window: &DateSpan) -> Option<DateSpan> {
        if !self.overlaps(window) {
            return None;
        }
        Some(DateSpan {
            start: self.start.max(window.start),
            end: self.end.min(window.end),
        })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        self.start.iter_days().take(self.len_days().max(0) as usize)
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A rentable unit. Provisioned by an administrator, read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Customer contact fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub guest: Guest,
    pub item_id: ItemId,
    pub span: DateSpan,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub guest: Guest,
    pub item_id: ItemId,
    pub span: DateSpan,
}

/// What a restriction represents. Numeric tags are the stored column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionKind {
    Reservation,
    Block,
}

impl RestrictionKind {
    pub fn code(self) -> i32 {
        match self {
            RestrictionKind::Reservation => 1,
            RestrictionKind::Block => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RestrictionKind::Reservation),
            2 => Some(RestrictionKind::Block),
            _ => None,
        }
    }
}

/// One interval of unavailability for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub id: RestrictionId,
    pub item_id: ItemId,
    pub span: DateSpan,
    /// `None` for manual blocks.
    pub reservation_id: Option<ReservationId>,
    pub kind: RestrictionKind,
}

impl Restriction {
    pub fn is_block(&self) -> bool {
        self.kind == RestrictionKind::Block
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRestriction {
    pub item_id: ItemId,
    pub span: DateSpan,
    pub reservation_id: Option<ReservationId>,
    pub kind: RestrictionKind,
}

impl NewRestriction {
    /// One-day manual block.
    pub fn block(item_id: ItemId, date: NaiveDate) -> Self {
        Self {
            item_id,
            span: DateSpan::day(date),
            reservation_id: None,
            kind: RestrictionKind::Block,
        }
    }

    pub fn for_reservation(item_id: ItemId, span: DateSpan, reservation_id: ReservationId) -> Self {
        Self {
            item_id,
            span,
            reservation_id: Some(reservation_id),
            kind: RestrictionKind::Reservation,
        }
    }
}

/// Ids assigned by a committed booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub reservation_id: ReservationId,
    pub restriction_id: RestrictionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    /// Reservations whose processed flag is still unset.
    Unprocessed,
}

/// In-memory view of one item: its catalog entry plus every restriction on it.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: Item,
    /// Sorted by `span.start`, ties by id.
    pub restrictions: Vec<Restriction>,
}

impl ItemState {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            restrictions: Vec::new(),
        }
    }

    /// Insert restriction maintaining sort order by (start, id).
    pub fn insert_restriction(&mut self, restriction: Restriction) {
        let key = (restriction.span.start, restriction.id);
        let pos = self
            .restrictions
            .binary_search_by_key(&key, |r| (r.span.start, r.id))
            .unwrap_or_else(|e| e);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: RestrictionId) -> Option<Restriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    /// Drop every restriction owned by a reservation, returning the removed ids.
    pub fn remove_owned_by(&mut self, reservation_id: ReservationId) -> Vec<RestrictionId> {
        let mut removed = Vec::new();
        self.restrictions.retain(|r| {
            if r.reservation_id == Some(reservation_id) {
                removed.push(r.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Restrictions intersecting `query` (closed intervals).
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &Restriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.span.start <= query.end);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= query.start)
    }

    pub fn is_free(&self, query: &DateSpan) -> bool {
        self.overlapping(query).next().is_none()
    }
}

/// Journal record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemAdded {
        item: Item,
    },
    ReservationInserted {
        reservation: Reservation,
    },
    /// Reservation and its restriction, committed as one record.
    ReservationBooked {
        reservation: Reservation,
        restriction: Restriction,
    },
    ReservationUpdated {
        id: ReservationId,
        item_id: ItemId,
        guest: Guest,
        updated_at: DateTime<Utc>,
    },
    ReservationProcessed {
        id: ReservationId,
        item_id: ItemId,
        processed: bool,
        updated_at: DateTime<Utc>,
    },
    /// Removes the reservation and every restriction it owns.
    ReservationDeleted {
        id: ReservationId,
        item_id: ItemId,
    },
    RestrictionAdded {
        restriction: Restriction,
    },
    RestrictionRemoved {
        id: RestrictionId,
        item_id: ItemId,
    },
}
