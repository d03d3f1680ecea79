//! Process configuration, read once from `LARDER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::auth::Credentials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared password for every login except the staff user.
    pub password: String,
    pub staff_user: String,
    pub staff_password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub outbox_capacity: usize,
    pub notice_max_attempts: u32,
    /// Approved bookings this many days old are swept to `no_show`.
    pub no_show_grace_days: u32,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "larder".into(),
            staff_user: "staff".into(),
            staff_password: "larder-staff".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            outbox_capacity: 1024,
            notice_max_attempts: 5,
            no_show_grace_days: 1,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys keep their defaults;
    /// unparsable values are logged and also keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            bind: text("LARDER_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "LARDER_PORT", d.port),
            data_dir: text("LARDER_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: text("LARDER_PASSWORD").unwrap_or(d.password),
            staff_user: text("LARDER_STAFF_USER").unwrap_or(d.staff_user),
            staff_password: text("LARDER_STAFF_PASSWORD").unwrap_or(d.staff_password),
            max_connections: positive(&lookup, "LARDER_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: positive(&lookup, "LARDER_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: text("LARDER_METRICS_PORT").and_then(|raw| match raw.trim().parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!(key = "LARDER_METRICS_PORT", value = %raw, "invalid value, metrics disabled");
                    None
                }
            }),
            tls_cert: text("LARDER_TLS_CERT"),
            tls_key: text("LARDER_TLS_KEY"),
            outbox_capacity: positive(&lookup, "LARDER_OUTBOX_CAPACITY", d.outbox_capacity),
            notice_max_attempts: positive(&lookup, "LARDER_NOTICE_MAX_ATTEMPTS", d.notice_max_attempts),
            no_show_grace_days: parsed(&lookup, "LARDER_NO_SHOW_GRACE_DAYS", d.no_show_grace_days),
            sweep_interval: Duration::from_secs(positive(
                &lookup,
                "LARDER_SWEEP_INTERVAL_SECS",
                d.sweep_interval.as_secs(),
            )),
        }
    }

    pub fn credentials(&self) -> Credentials {
        if self.staff_password == self.password {
            warn!("LARDER_STAFF_PASSWORD equals LARDER_PASSWORD, any login can act as staff");
        }
        Credentials {
            password: self.password.clone(),
            staff_user: self.staff_user.clone(),
            staff_password: self.staff_password.clone(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("larder.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }
    }
}

/// Like [`parsed`], but zero also falls back to the default.
fn positive<T: FromStr + PartialEq + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) if raw.trim().parse::<T>().is_ok_and(|v| v == T::default()) => {
            warn!(key, value = %raw, "must be greater than zero, using default");
            default
        }
        _ => parsed(lookup, key, default),
    }
}
