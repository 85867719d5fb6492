use chrono::Utc;
use serde_json::json;

use crate::calendar::{BlockSubmission, Month};
use crate::limits::MAX_CONTACT_FIELD_LEN;
use crate::model::*;
use crate::session::SessionId;

use super::{App, Form, Outcome};

const CALENDAR: &str = "/admin/reservations-calendar";

/// Which admin view a reservation was opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    All,
    New,
    Calendar,
}

impl ListKind {
    /// Path segment as used in `/admin/reservations/<kind>/<id>`.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "all" => Some(ListKind::All),
            "new" => Some(ListKind::New),
            "cal" => Some(ListKind::Calendar),
            _ => None,
        }
    }

    pub fn segment(self) -> &'static str {
        match self {
            ListKind::All => "all",
            ListKind::New => "new",
            ListKind::Calendar => "cal",
        }
    }

    fn list_path(self) -> &'static str {
        match self {
            ListKind::All => "/admin/reservations-all",
            ListKind::New => "/admin/reservations-new",
            ListKind::Calendar => CALENDAR,
        }
    }

    /// Back to the originating view, keeping the calendar month if one was given.
    fn back(self, year: &str, month: &str) -> String {
        if year.is_empty() || month.is_empty() {
            self.list_path().to_string()
        } else {
            format!("{}?y={year}&m={month}", self.list_path())
        }
    }
}

fn parse_id(raw: &str) -> Option<ReservationId> {
    raw.trim().parse().ok().filter(|id| *id > 0)
}

impl App {
    pub async fn reservations(&self, sid: SessionId, kind: ListKind) -> Outcome {
        let (filter, template) = match kind {
            ListKind::New => (ReservationFilter::Unprocessed, "admin-new-reservations.page.html"),
            _ => (ReservationFilter::All, "admin-all-reservations.page.html"),
        };
        let reservations = match self.store.reservations(filter).await {
            Ok(list) => list,
            Err(e) => return self.fail_with(sid, &e, "/admin/dashboard"),
        };
        self.render(sid, template, json!({ "reservations": reservations }))
    }

    pub async fn show_reservation(&self, sid: SessionId, kind: ListKind, id: &str, query: &Form) -> Outcome {
        let back = kind.back(query.get("y"), query.get("m"));
        let Some(id) = parse_id(id) else {
            return self.fail(sid, "invalid reservation id", back);
        };
        let reservation = match self.store.reservation(id).await {
            Ok(r) => r,
            Err(e) => return self.fail_with(sid, &e, back),
        };
        let item = self.store.item(reservation.item_id).await.ok();
        self.render(
            sid,
            "admin-show-reservation.page.html",
            json!({
                "reservation": reservation,
                "item": item,
                "type": kind.segment(),
                "year": query.get("y"),
                "month": query.get("m"),
            }),
        )
    }

    /// Contact details edit. `year`/`month` form fields, when set, return the
    /// administrator to the calendar month they came from.
    pub async fn post_show_reservation(&self, sid: SessionId, kind: ListKind, id: &str, form: &Form) -> Outcome {
        let back = kind.back(form.get("year"), form.get("month"));
        let Some(id) = parse_id(id) else {
            return self.fail(sid, "invalid reservation id", back);
        };
        let guest = Guest {
            first_name: form.get("first_name").trim().to_string(),
            last_name: form.get("last_name").trim().to_string(),
            email: form.get("email").trim().to_string(),
            phone: form.get("phone").trim().to_string(),
        };
        if [&guest.first_name, &guest.last_name, &guest.email, &guest.phone]
            .iter()
            .any(|v| v.len() > MAX_CONTACT_FIELD_LEN)
        {
            return self.fail(sid, "contact field too long", back);
        }
        if let Err(e) = self.store.update_reservation(id, guest).await {
            return self.fail_with(sid, &e, back);
        }
        self.flash(sid, "Saved successfully");
        Outcome::redirect(back)
    }

    pub async fn process_reservation(&self, sid: SessionId, kind: ListKind, id: &str, query: &Form) -> Outcome {
        let back = kind.back(query.get("y"), query.get("m"));
        let Some(id) = parse_id(id) else {
            return self.fail(sid, "can't get id", back);
        };
        if let Err(e) = self.store.update_reservation_processed(id, true).await {
            return self.fail_with(sid, &e, back);
        }
        self.flash(sid, "Reservation marked as processed");
        Outcome::redirect(back)
    }

    pub async fn delete_reservation(&self, sid: SessionId, kind: ListKind, id: &str, query: &Form) -> Outcome {
        let back = kind.back(query.get("y"), query.get("m"));
        let Some(id) = parse_id(id) else {
            return self.fail(sid, "can't get id", back);
        };
        if let Err(e) = self.store.delete_reservation(id).await {
            return self.fail_with(sid, &e, back);
        }
        self.flash(sid, "Reservation deleted");
        Outcome::redirect(back)
    }

    /// Month grid for every item. Without `y`/`m` shows the current month.
    pub async fn reservations_calendar(&self, sid: SessionId, query: &Form) -> Outcome {
        let month = if query.get("y").is_empty() {
            Month::containing(Utc::now().date_naive())
        } else {
            match Month::parse(query.get("y"), query.get("m")) {
                Ok(m) => m,
                Err(e) => return self.fail_with(sid, &e, CALENDAR),
            }
        };
        match self.calendar.render_month(sid, month).await {
            Ok(view) => self.render(
                sid,
                "admin-reservations-calendar.page.html",
                json!({ "calendar": view }),
            ),
            Err(e) => self.fail_with(sid, &e, CALENDAR),
        }
    }

    pub async fn post_reservations_calendar(&self, sid: SessionId, form: &Form) -> Outcome {
        if !form.has("y") || !form.has("m") {
            return self.fail(sid, "can't get year or month", CALENDAR);
        }
        let month = match Month::parse(form.get("y"), form.get("m")) {
            Ok(m) => m,
            Err(e) => return self.fail_with(sid, &e, CALENDAR),
        };
        let submission = match BlockSubmission::from_fields(form.names()) {
            Ok(s) => s,
            Err(e) => return self.fail_with(sid, &e, CALENDAR),
        };
        if let Err(e) = self.calendar.reconcile(sid, month, &submission).await {
            return self.fail_with(sid, &e, CALENDAR);
        }
        self.flash(sid, "changes saved");
        Outcome::redirect(format!("{CALENDAR}?y={}&m={}", month.year, month.month))
    }
}
