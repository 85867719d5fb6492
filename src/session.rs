//! Per-visitor key/value state carried between requests.
//!
//! Values go through `serde_json`, so whatever a handler stores comes back
//! as the same type, maps included. A missing session or key reads as `None`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("bad session id: {e}")))
    }
}

#[derive(Debug)]
struct Session {
    values: HashMap<String, serde_json::Value>,
    last_seen: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            last_seen: Instant::now(),
        }
    }
}

pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            lifetime,
        }
    }

    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(id, Session::new());
        self.report_active();
        id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn put<T: Serialize>(&self, id: SessionId, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| Error::persistence("session_put", e))?;
        let mut created = false;
        let mut session = self.sessions.entry(id).or_insert_with(|| {
            created = true;
            Session::new()
        });
        session.values.insert(key.to_string(), value);
        session.last_seen = Instant::now();
        drop(session);
        if created {
            self.report_active();
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, id: SessionId, key: &str) -> Result<Option<T>> {
        let Some(mut session) = self.live_session(id) else {
            return Ok(None);
        };
        session.last_seen = Instant::now();
        session
            .values
            .get(key)
            .map(|v| T::deserialize(v).map_err(|e| Error::persistence("session_get", e)))
            .transpose()
    }

    /// Read and remove, for one-shot values such as flash messages.
    pub fn take<T: DeserializeOwned>(&self, id: SessionId, key: &str) -> Result<Option<T>> {
        let Some(mut session) = self.live_session(id) else {
            return Ok(None);
        };
        session.last_seen = Instant::now();
        session
            .values
            .remove(key)
            .map(|v| serde_json::from_value(v).map_err(|e| Error::persistence("session_take", e)))
            .transpose()
    }

    pub fn remove(&self, id: SessionId, key: &str) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.values.remove(key);
        }
    }

    pub fn destroy(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            self.report_active();
        }
    }

    /// Drop sessions idle for longer than the lifetime. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let before = self.sessions.len();
        let lifetime = self.lifetime;
        self.sessions.retain(|_, s| s.last_seen.elapsed() <= lifetime);
        let swept = before.saturating_sub(self.sessions.len());
        if swept > 0 {
            self.report_active();
        }
        swept
    }

    fn live_session(
        &self,
        id: SessionId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, SessionId, Session>> {
        let session = self.sessions.get_mut(&id)?;
        if session.last_seen.elapsed() > self.lifetime {
            drop(session);
            self.destroy(id);
            return None;
        }
        Some(session)
    }

    fn report_active(&self) {
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}
