use serde_json::json;
use tracing::error;

use crate::booking::{BookingForm, DATE_FORMAT, parse_date};
use crate::error::Error;
use crate::model::*;
use crate::session::SessionId;

use super::{App, DRAFT_KEY, Draft, Form, Outcome};

const HOME: &str = "/";
const SEARCH: &str = "/search-availability";
const MAKE_RESERVATION: &str = "/make-reservation";
const SUMMARY: &str = "/reservation-summary";

fn dates(form: &Form, start_key: &str, end_key: &str) -> Result<DateSpan, &'static str> {
    let start = parse_date(form.get(start_key)).ok_or("can't parse start date")?;
    let end = parse_date(form.get(end_key)).ok_or("can't parse end date")?;
    DateSpan::new(start, end).map_err(|_| "end date is before start date")
}

impl App {
    /// Search form post: list every item free for the whole range.
    pub async fn search_availability(&self, sid: SessionId, form: &Form) -> Outcome {
        let span = match dates(form, "start_date", "end_date") {
            Ok(span) => span,
            Err(msg) => return self.fail(sid, msg, HOME),
        };
        let items = match self.availability.available_items(span.start, span.end).await {
            Ok(items) => items,
            Err(e) => return self.fail_with(sid, &e, HOME),
        };
        if items.is_empty() {
            return self.fail(sid, "no availability", SEARCH);
        }

        let draft = Draft {
            span: Some(span),
            ..Draft::default()
        };
        if let Err(e) = self.save_draft(sid, &draft) {
            return self.fail_with(sid, &e, HOME);
        }
        self.render(sid, "choose-laptop.page.html", json!({ "items": items }))
    }

    /// Availability check for one item, answered as JSON for the modal dialog.
    pub async fn availability_json(&self, form: &Form) -> Outcome {
        let reply = |ok: bool, message: &str| {
            Outcome::Json(json!({
                "ok": ok,
                "message": message,
                "item_id": form.get("item_id"),
                "start_date": form.get("start_date"),
                "end_date": form.get("end_date"),
            }))
        };
        let Some(start) = parse_date(form.get("start_date")) else {
            return reply(false, "Invalid Start Date");
        };
        let Some(end) = parse_date(form.get("end_date")) else {
            return reply(false, "Invalid End Date");
        };
        let Ok(item_id) = form.get("item_id").trim().parse::<ItemId>() else {
            return reply(false, "Invalid Item ID");
        };
        match self.availability.is_item_available(item_id, start, end).await {
            Ok(true) => reply(true, "Available!"),
            Ok(false) => reply(false, "Not Available!"),
            Err(Error::Persistence { .. }) => {
                error!(item_id, "availability lookup failed");
                reply(false, "Error connecting to the database")
            }
            Err(e) => reply(false, &e.user_message()),
        }
    }

    /// Item picked from the search results.
    pub async fn choose_item(&self, sid: SessionId, item_id: &str) -> Outcome {
        let Ok(item_id) = item_id.trim().parse::<ItemId>() else {
            return self.fail(sid, "invalid item id", HOME);
        };
        let Some(mut draft) = self.draft(sid) else {
            return self.fail(sid, "can't get reservation from session", HOME);
        };
        draft.item_id = Some(item_id);
        draft.item_name = None;
        if let Err(e) = self.save_draft(sid, &draft) {
            return self.fail_with(sid, &e, HOME);
        }
        Outcome::redirect(MAKE_RESERVATION)
    }

    /// Direct link from an item page: `?id=<item>&s=<start>&e=<end>`.
    pub async fn rent_item(&self, sid: SessionId, query: &Form) -> Outcome {
        let Ok(item_id) = query.get("id").trim().parse::<ItemId>() else {
            return self.fail(sid, "invalid item id", HOME);
        };
        let span = match dates(query, "s", "e") {
            Ok(span) => span,
            Err(msg) => return self.fail(sid, msg, HOME),
        };
        let item = match self.store.item(item_id).await {
            Ok(item) => item,
            Err(e) => return self.fail_with(sid, &e, HOME),
        };
        let draft = Draft {
            span: Some(span),
            item_id: Some(item.id),
            item_name: Some(item.name),
            ..Draft::default()
        };
        if let Err(e) = self.save_draft(sid, &draft) {
            return self.fail_with(sid, &e, HOME);
        }
        Outcome::redirect(MAKE_RESERVATION)
    }

    /// The reservation form, prefilled from the draft.
    pub async fn make_reservation(&self, sid: SessionId) -> Outcome {
        let Some(mut draft) = self.draft(sid) else {
            return self.fail(sid, "can't get reservation from session", HOME);
        };
        let (Some(item_id), Some(span)) = (draft.item_id, draft.span) else {
            return self.fail(sid, "can't get reservation from session", HOME);
        };
        let item = match self.store.item(item_id).await {
            Ok(item) => item,
            Err(e) => return self.fail_with(sid, &e, HOME),
        };
        draft.item_name = Some(item.name.clone());
        if let Err(e) = self.save_draft(sid, &draft) {
            return self.fail_with(sid, &e, HOME);
        }
        self.render(
            sid,
            "make-reservation.page.html",
            json!({
                "reservation": draft,
                "item": item,
                "start_date": span.start.format(DATE_FORMAT).to_string(),
                "end_date": span.end.format(DATE_FORMAT).to_string(),
                "errors": {},
            }),
        )
    }

    /// Reservation form post. Invalid input re-renders the form with field
    /// errors; a lost race sends the customer back to search.
    pub async fn post_make_reservation(&self, sid: SessionId, form: &Form) -> Outcome {
        let Some(mut draft) = self.draft(sid) else {
            return self.fail(sid, "can't get reservation from session", HOME);
        };
        let booking_form = BookingForm {
            item_id: form.get("item_id").to_string(),
            first_name: form.get("first_name").to_string(),
            last_name: form.get("last_name").to_string(),
            email: form.get("email").to_string(),
            phone: form.get("phone").to_string(),
            start_date: form.get("start_date").to_string(),
            end_date: form.get("end_date").to_string(),
        };

        let new = match booking_form.validate() {
            Ok(new) => new,
            Err(errors) => {
                draft.guest = Guest {
                    first_name: booking_form.first_name.clone(),
                    last_name: booking_form.last_name.clone(),
                    email: booking_form.email.clone(),
                    phone: booking_form.phone.clone(),
                };
                return self.render(
                    sid,
                    "make-reservation.page.html",
                    json!({
                        "reservation": draft,
                        "start_date": booking_form.start_date,
                        "end_date": booking_form.end_date,
                        "errors": errors,
                    }),
                );
            }
        };

        let confirmation = match self.booking.commit(new).await {
            Ok(c) => c,
            Err(e @ Error::Conflict { .. }) => return self.fail_with(sid, &e, SEARCH),
            Err(e) => return self.fail_with(sid, &e, HOME),
        };

        let draft = Draft {
            span: Some(confirmation.span),
            item_id: Some(confirmation.item.id),
            item_name: Some(confirmation.item.name),
            guest: confirmation.guest,
            booking: Some(confirmation.booking),
        };
        if let Err(e) = self.save_draft(sid, &draft) {
            // Booked but the summary is lost; the customer still gets the mail.
            error!(reservation_id = confirmation.booking.reservation_id, "can't store summary: {e}");
            self.flash(sid, "Reservation confirmed");
            return Outcome::redirect(HOME);
        }
        Outcome::redirect(SUMMARY)
    }

    /// Shown once; the draft is cleared on the way out.
    pub async fn reservation_summary(&self, sid: SessionId) -> Outcome {
        let draft: Option<Draft> = self.sessions.take(sid, DRAFT_KEY).unwrap_or_default();
        let Some(draft) = draft.filter(|d| d.booking.is_some()) else {
            return self.fail(sid, "can't get reservation from session", HOME);
        };
        let (start, end) = draft
            .span
            .map(|s| (s.start.format(DATE_FORMAT).to_string(), s.end.format(DATE_FORMAT).to_string()))
            .unwrap_or_default();
        self.render(
            sid,
            "reservation-summary.page.html",
            json!({ "reservation": draft, "start_date": start, "end_date": end }),
        )
    }
}
