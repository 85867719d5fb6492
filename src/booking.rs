//! Turning a submitted reservation form into a committed booking.
//!
//! Stages run strictly in order and nothing is retried: validate, look up the
//! item, re-check availability, commit reservation and restriction as one
//! unit, then queue the two notification mails.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::availability::AvailabilityEngine;
use crate::error::{Error, Result};
use crate::limits::*;
use crate::mail::{MailData, MailQueue};
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw form values, exactly as a browser posts them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingForm {
    pub item_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub start_date: String,
    pub end_date: String,
}

/// Per-field validation messages, keyed by form field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, msg: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// First message for a field, for display beside the input.
    pub fn first(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|m| m.first()).map(String::as_str)
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, msgs) in &self.0 {
            for msg in msgs {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {msg}")?;
                first = false;
            }
        }
        Ok(())
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

fn looks_like_email(raw: &str) -> bool {
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !raw.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

impl BookingForm {
    pub fn validate(&self) -> std::result::Result<NewReservation, FieldErrors> {
        let mut errors = FieldErrors::default();

        for (field, value) in [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("email", &self.email),
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
        ] {
            if value.trim().is_empty() {
                errors.add(field, "This field cannot be blank");
            }
        }
        for (field, value) in [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("email", &self.email),
            ("phone", &self.phone),
        ] {
            if value.len() > MAX_CONTACT_FIELD_LEN {
                errors.add(field, format!("must be at most {MAX_CONTACT_FIELD_LEN} characters"));
            }
        }

        let first_name = self.first_name.trim();
        if !first_name.is_empty() && first_name.chars().count() < MIN_FIRST_NAME_LEN {
            errors.add(
                "first_name",
                format!("This field must be at least {MIN_FIRST_NAME_LEN} characters long"),
            );
        }
        if !self.email.trim().is_empty() && !looks_like_email(self.email.trim()) {
            errors.add("email", "Invalid email address");
        }

        let start = self.date_field("start_date", &self.start_date, &mut errors);
        let end = self.date_field("end_date", &self.end_date, &mut errors);

        let item_id = match self.item_id.trim().parse::<ItemId>() {
            Ok(id) if id > 0 => Some(id),
            _ => {
                errors.add("item_id", "Invalid item id");
                None
            }
        };

        let span = match (start, end) {
            (Some(start), Some(end)) => match DateSpan::new(start, end) {
                Ok(span) if span.len_days() > MAX_BOOKING_DAYS => {
                    errors.add("end_date", format!("bookings are limited to {MAX_BOOKING_DAYS} days"));
                    None
                }
                Ok(span) => Some(span),
                Err(_) => {
                    errors.add("end_date", "End date must not be before start date");
                    None
                }
            },
            _ => None,
        };

        match (item_id, span) {
            (Some(item_id), Some(span)) if errors.is_empty() => Ok(NewReservation {
                guest: Guest {
                    first_name: first_name.to_string(),
                    last_name: self.last_name.trim().to_string(),
                    email: self.email.trim().to_string(),
                    phone: self.phone.trim().to_string(),
                },
                item_id,
                span,
            }),
            _ => Err(errors),
        }
    }

    fn date_field(&self, field: &str, raw: &str, errors: &mut FieldErrors) -> Option<NaiveDate> {
        if raw.trim().is_empty() {
            return None;
        }
        let parsed = parse_date(raw);
        if parsed.is_none() {
            errors.add(field, "Invalid date, expected YYYY-MM-DD");
        }
        parsed
    }
}

/// What the customer sees after a successful booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub booking: Booking,
    pub item: Item,
    pub guest: Guest,
    pub span: DateSpan,
}

#[derive(Clone)]
pub struct BookingWorkflow {
    availability: AvailabilityEngine,
    mail: MailQueue,
    mail_from: String,
    admin_email: String,
}

impl BookingWorkflow {
    pub fn new(
        availability: AvailabilityEngine,
        mail: MailQueue,
        mail_from: impl Into<String>,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            availability,
            mail,
            mail_from: mail_from.into(),
            admin_email: admin_email.into(),
        }
    }

    /// All stages, starting from raw form input.
    pub async fn book(&self, form: &BookingForm) -> Result<Confirmation> {
        let new = form.validate().map_err(|errors| {
            metrics::counter!(BOOKINGS_TOTAL, "status" => "invalid").increment(1);
            Error::validation(errors.to_string())
        })?;
        self.commit(new).await
    }

    /// Stages after validation. Availability is re-checked here no matter
    /// what an earlier search said.
    pub async fn commit(&self, new: NewReservation) -> Result<Confirmation> {
        let result = self.commit_inner(new).await;
        let status = match &result {
            Ok(_) => "confirmed",
            Err(Error::Validation(_)) => "invalid",
            Err(Error::NotFound { .. }) => "not_found",
            Err(Error::Conflict { .. }) => "conflict",
            Err(Error::Persistence { .. }) => "error",
        };
        metrics::counter!(BOOKINGS_TOTAL, "status" => status).increment(1);
        if let Err(e) = &result {
            warn!(status, "booking not committed: {e}");
        }
        result
    }

    async fn commit_inner(&self, new: NewReservation) -> Result<Confirmation> {
        let store = self.availability.store();
        let item = store.item(new.item_id).await?;

        if !self.availability.check(new.item_id, new.span).await?.is_empty() {
            return Err(Error::Conflict {
                item_id: new.item_id,
                span: new.span,
            });
        }

        let booking = store.commit_booking(new.clone()).await?;
        info!(
            reservation_id = booking.reservation_id,
            item = %item.name,
            span = %new.span,
            "reservation confirmed"
        );

        let confirmation = Confirmation {
            booking,
            item,
            guest: new.guest,
            span: new.span,
        };
        self.notify(&confirmation);
        Ok(confirmation)
    }

    /// Best effort: a full or closed queue is logged, the booking stands.
    fn notify(&self, c: &Confirmation) {
        let start = c.span.start.format(DATE_FORMAT);
        let end = c.span.end.format(DATE_FORMAT);
        let customer = MailData {
            to: c.guest.email.clone(),
            from: self.mail_from.clone(),
            subject: "Reservation Confirmation".into(),
            template: "basic.email.html".into(),
            content: format!(
                "<strong>Reservation Confirmation</strong><br>\
                 Dear {}:<br>\
                 This is a confirmation of your reservation of {} from {start} to {end}.",
                c.guest.first_name, c.item.name
            ),
        };
        let operator = MailData {
            to: self.admin_email.clone(),
            from: self.mail_from.clone(),
            subject: "Reservation Confirmation".into(),
            template: "basic.email.html".into(),
            content: format!(
                "<strong>Reservation Confirmation</strong><br>\
                 A reservation has been made for {} from {start} to {end}.",
                c.item.name
            ),
        };
        for mail in [customer, operator] {
            let to = mail.to.clone();
            if let Err(e) = self.mail.enqueue(mail) {
                warn!(reservation_id = c.booking.reservation_id, %to, "notification not queued: {e}");
            }
        }
    }
}
