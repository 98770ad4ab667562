//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEV_PASSWORD: &str = "dev-password";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Credentials accepted by the front door.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Postgres URL; `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub downstream_url: String,
    pub downstream_password: String,
    pub auth: BasicCredentials,
    pub dispatch_timeout: Duration,
    pub max_concurrent_dispatches: usize,
    pub poll_interval: Duration,
    /// In-progress lease before an unanswered job is dispatched again.
    pub reclaim_after: Duration,
    pub unavailable_sleep_factor: u32,
}

impl ServerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind = parse_or(&var, "RELAYQ_BIND", "socket address", || {
            SocketAddr::from(([0, 0, 0, 0], 9090))
        })?;

        let downstream_password = var("RELAYQ_DOWNSTREAM_PASSWORD").unwrap_or_else(|| {
            warn!("RELAYQ_DOWNSTREAM_PASSWORD not set; using insecure dev default");
            DEV_PASSWORD.to_string()
        });
        let auth_password = var("RELAYQ_AUTH_PASSWORD").unwrap_or_else(|| {
            warn!("RELAYQ_AUTH_PASSWORD not set; using insecure dev default");
            DEV_PASSWORD.to_string()
        });

        Ok(Self {
            bind,
            database_url: var("DATABASE_URL"),
            downstream_url: var("RELAYQ_DOWNSTREAM_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9091".to_string()),
            downstream_password,
            auth: BasicCredentials {
                user: var("RELAYQ_AUTH_USER").unwrap_or_else(|| "jobs".to_string()),
                password: auth_password,
            },
            dispatch_timeout: Duration::from_millis(parse_or(
                &var,
                "RELAYQ_DISPATCH_TIMEOUT_MS",
                "millisecond count",
                || 30_000u64,
            )?),
            max_concurrent_dispatches: parse_or(
                &var,
                "RELAYQ_MAX_CONCURRENT_DISPATCHES",
                "positive integer",
                || 10usize,
            )?
            .max(1),
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "RELAYQ_POLL_INTERVAL_MS",
                "millisecond count",
                || 100u64,
            )?),
            reclaim_after: Duration::from_millis(parse_or(
                &var,
                "RELAYQ_RECLAIM_AFTER_MS",
                "millisecond count",
                || 300_000u64,
            )?),
            unavailable_sleep_factor: parse_or(
                &var,
                "RELAYQ_UNAVAILABLE_SLEEP_FACTOR",
                "non-negative integer",
                || 1u32,
            )?,
        })
    }

    /// Postgres pool size: one connection per dispatch slot plus headroom for
    /// status callbacks.
    pub fn pool_size(&self) -> u32 {
        u32::try_from(self.max_concurrent_dispatches)
            .unwrap_or(u32::MAX)
            .saturating_add(2)
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    expected: &'static str,
    default: impl FnOnce() -> T,
) -> Result<T, ConfigError> {
    match var(key) {
        None => Ok(default()),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var: key,
            value: raw,
            expected,
        }),
    }
}
