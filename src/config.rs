use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime settings, read from `LOANER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Selects the PostgreSQL backend when set.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub store_timeout: Duration,
    /// Journal appends after which the compactor rewrites the journal.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub mail_from: String,
    pub admin_email: String,
    pub mail_queue_capacity: usize,
    pub session_lifetime: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_url: None,
            db_max_connections: 10,
            store_timeout: Duration::from_millis(3000),
            compact_threshold: 1000,
            metrics_port: None,
            mail_from: "me@here.com".into(),
            admin_email: "me@here.com".into(),
            mail_queue_capacity: 256,
            session_lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys fall back to defaults; set but
    /// unparsable values are rejected rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            data_dir: get("LOANER_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            database_url: get("LOANER_DATABASE_URL"),
            db_max_connections: parse(&get, "LOANER_DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            store_timeout: parse(&get, "LOANER_STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            compact_threshold: parse(&get, "LOANER_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse(&get, "LOANER_METRICS_PORT")?,
            mail_from: get("LOANER_MAIL_FROM").unwrap_or(defaults.mail_from),
            admin_email: get("LOANER_ADMIN_EMAIL").unwrap_or(defaults.admin_email),
            mail_queue_capacity: parse(&get, "LOANER_MAIL_QUEUE_CAPACITY")?
                .unwrap_or(defaults.mail_queue_capacity),
            session_lifetime: parse(&get, "LOANER_SESSION_LIFETIME_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_lifetime),
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("loaner.wal")
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::validation(format!("{key}: cannot parse {raw:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.store_timeout, Duration::from_secs(3));
        assert_eq!(cfg.journal_path(), PathBuf::from("./data/loaner.wal"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("LOANER_DATA_DIR", "/var/lib/loaner"),
            ("LOANER_DATABASE_URL", "postgres://loaner@localhost/loaner"),
            ("LOANER_STORE_TIMEOUT_MS", "250"),
            ("LOANER_METRICS_PORT", "9100"),
            ("LOANER_SESSION_LIFETIME_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/loaner"));
        assert!(cfg.database_url.is_some());
        assert_eq!(cfg.store_timeout, Duration::from_millis(250));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.session_lifetime, Duration::from_secs(60));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = Config::from_lookup(lookup(&[("LOANER_DATABASE_URL", "  ")])).unwrap();
        assert_eq!(cfg.database_url, None);
    }

    #[test]
    fn garbage_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[("LOANER_COMPACT_THRESHOLD", "lots")])).unwrap_err();
        assert!(err.to_string().contains("LOANER_COMPACT_THRESHOLD"));
    }
}
