use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::LockPolicy;
use crate::model::Ms;
use crate::tenant::TenantSettings;

const DAY_MS: Ms = 24 * 60 * 60 * 1000;

/// Server settings, read once from `TEESHEET_*` environment variables.
/// Unset or unparseable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_policy: LockPolicy,
    pub dedup_retention_ms: Ms,
    pub event_queue: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = LockPolicy::default();

        Self {
            port: parsed(&lookup, "TEESHEET_PORT").unwrap_or(5433),
            bind: lookup("TEESHEET_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("TEESHEET_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("TEESHEET_PASSWORD").unwrap_or_else(|| "teesheet".into()),
            max_connections: parsed(&lookup, "TEESHEET_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "TEESHEET_COMPACT_THRESHOLD").unwrap_or(1000),
            lock_policy: LockPolicy {
                lock_timeout: parsed(&lookup, "TEESHEET_LOCK_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.lock_timeout),
                retries: parsed(&lookup, "TEESHEET_LOCK_RETRIES").unwrap_or(defaults.retries),
                backoff: parsed(&lookup, "TEESHEET_LOCK_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff),
            },
            dedup_retention_ms: parsed(&lookup, "TEESHEET_DEDUP_RETENTION_MS").unwrap_or(7 * DAY_MS),
            event_queue: parsed(&lookup, "TEESHEET_EVENT_QUEUE").unwrap_or(1024),
            metrics_port: parsed(&lookup, "TEESHEET_METRICS_PORT"),
            tls_cert: lookup("TEESHEET_TLS_CERT"),
            tls_key: lookup("TEESHEET_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            lock_policy: self.lock_policy,
            dedup_retention_ms: self.dedup_retention_ms,
            event_queue: self.event_queue,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
