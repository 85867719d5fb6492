//! Request handlers, minus HTTP.
//!
//! Each handler takes already-decoded form or query values plus the caller's
//! session and answers with an [`Outcome`]: where to redirect, which template
//! to render with what data, or a JSON body. Failures never escape as errors;
//! they become a flash message in the session and a redirect.

pub mod admin;
pub mod site;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use crate::availability::AvailabilityEngine;
use crate::booking::BookingWorkflow;
use crate::calendar::Calendar;
use crate::config::Config;
use crate::error::Error;
use crate::mail::MailQueue;
use crate::model::*;
use crate::session::{SessionId, SessionStore};
use crate::store::IntervalStore;

pub const FLASH_KEY: &str = "flash";
pub const ERROR_KEY: &str = "error";
/// Session key of the in-progress booking.
pub const DRAFT_KEY: &str = "reservation";

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Redirect(String),
    Render { template: &'static str, data: Value },
    Json(Value),
}

impl Outcome {
    pub fn redirect(to: impl Into<String>) -> Self {
        Outcome::Redirect(to.into())
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            Outcome::Redirect(to) => Some(to),
            _ => None,
        }
    }
}

/// Decoded form or query values. Missing fields read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form(BTreeMap<String, String>);

impl Form {
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Form {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Booking in progress, carried between search, item choice, the
/// reservation form and the summary page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub span: Option<DateSpan>,
    pub item_id: Option<ItemId>,
    pub item_name: Option<String>,
    pub guest: Guest,
    pub booking: Option<Booking>,
}

/// Everything a handler needs, built once at startup.
#[derive(Clone)]
pub struct App {
    pub store: Arc<dyn IntervalStore>,
    pub availability: AvailabilityEngine,
    pub booking: BookingWorkflow,
    pub calendar: Calendar,
    pub sessions: Arc<SessionStore>,
}

impl App {
    pub fn new(
        store: Arc<dyn IntervalStore>,
        sessions: Arc<SessionStore>,
        mail: MailQueue,
        config: &Config,
    ) -> Self {
        let availability = AvailabilityEngine::new(store.clone());
        let booking = BookingWorkflow::new(
            availability.clone(),
            mail,
            config.mail_from.clone(),
            config.admin_email.clone(),
        );
        let calendar = Calendar::new(store.clone(), sessions.clone());
        Self {
            store,
            availability,
            booking,
            calendar,
            sessions,
        }
    }

    pub(crate) fn flash(&self, sid: SessionId, msg: &str) {
        self.put_message(sid, FLASH_KEY, msg);
    }

    /// Record `msg` as the session's error and send the browser to `to`.
    pub(crate) fn fail(&self, sid: SessionId, msg: &str, to: impl Into<String>) -> Outcome {
        self.put_message(sid, ERROR_KEY, msg);
        Outcome::redirect(to)
    }

    /// Log the full error, show only the safe wording.
    pub(crate) fn fail_with(&self, sid: SessionId, err: &Error, to: impl Into<String>) -> Outcome {
        if matches!(err, Error::Persistence { .. }) {
            error!("{err}");
        } else {
            tracing::debug!("{err}");
        }
        self.fail(sid, &err.user_message(), to)
    }

    fn put_message(&self, sid: SessionId, key: &str, msg: &str) {
        if let Err(e) = self.sessions.put(sid, key, &msg) {
            error!(%sid, "can't store {key} message: {e}");
        }
    }

    pub(crate) fn draft(&self, sid: SessionId) -> Option<Draft> {
        match self.sessions.get(sid, DRAFT_KEY) {
            Ok(draft) => draft,
            Err(e) => {
                error!(%sid, "unreadable reservation draft: {e}");
                None
            }
        }
    }

    pub(crate) fn save_draft(&self, sid: SessionId, draft: &Draft) -> Result<(), Error> {
        self.sessions.put(sid, DRAFT_KEY, draft)
    }

    /// Render with pending flash and error messages folded into the data.
    pub(crate) fn render(&self, sid: SessionId, template: &'static str, mut data: Value) -> Outcome {
        let flash: Option<String> = self.sessions.take(sid, FLASH_KEY).unwrap_or_default();
        let err: Option<String> = self.sessions.take(sid, ERROR_KEY).unwrap_or_default();
        if let Value::Object(map) = &mut data {
            map.insert(FLASH_KEY.into(), json!(flash.unwrap_or_default()));
            map.insert(ERROR_KEY.into(), json!(err.unwrap_or_default()));
        }
        Outcome::Render { template, data }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::LocalStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub struct Harness {
        pub app: App,
        pub store: Arc<LocalStore>,
        pub sid: SessionId,
        pub mail_rx: mpsc::Receiver<crate::mail::MailData>,
    }

    pub async fn harness() -> Harness {
        let store = Arc::new(LocalStore::in_memory());
        store.add_item("Alienware m15").await.unwrap();
        store.add_item("MacBook Pro").await.unwrap();
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(600)));
        let sid = sessions.create();
        let (mail, mail_rx) = MailQueue::new(16);
        let app = App::new(store.clone(), sessions, mail, &Config::default());
        Harness {
            app,
            store,
            sid,
            mail_rx,
        }
    }

    impl Harness {
        pub fn error(&self) -> Option<String> {
            self.app.sessions.get(self.sid, ERROR_KEY).unwrap()
        }

        pub fn flash(&self) -> Option<String> {
            self.app.sessions.get(self.sid, FLASH_KEY).unwrap()
        }
    }

    pub fn form(pairs: &[(&str, &str)]) -> Form {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }
}
