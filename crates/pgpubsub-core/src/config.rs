//! Configuration for pgpubsub.
//!
//! Mirrors the shape of a typical `AppConfig`: a `serde`-deserializable
//! struct with per-field defaults, plus an environment-variable loader for
//! the common case of configuring a binary from its process environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level pgpubsub configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PubSubOptions {
    /// Enable single-consumer arbitration via the Channel Lock. When false,
    /// every connected session receives every notification.
    #[serde(default = "default_true")]
    pub single_listener: bool,

    /// Maximum consecutive reconnect attempts before giving up.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Channel Lock re-acquisition probe period, in milliseconds.
    #[serde(default = "default_acquire_interval_ms")]
    pub acquire_interval_ms: u64,

    /// Driver-specific connection parameters.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            single_listener: default_true(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            acquire_interval_ms: default_acquire_interval_ms(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl PubSubOptions {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized variables: `PGPUBSUB_SINGLE_LISTENER`, `PGPUBSUB_RETRY_LIMIT`,
    /// `PGPUBSUB_RETRY_DELAY_MS`, `PGPUBSUB_ACQUIRE_INTERVAL_MS`, plus
    /// `DATABASE_URL` / `PGPUBSUB_DB_*` for the connection.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PGPUBSUB_SINGLE_LISTENER") {
            if let Ok(b) = v.parse() {
                config.single_listener = b;
            }
        }
        if let Ok(v) = std::env::var("PGPUBSUB_RETRY_LIMIT") {
            if let Ok(n) = v.parse() {
                config.retry_limit = n;
            }
        }
        if let Ok(v) = std::env::var("PGPUBSUB_RETRY_DELAY_MS") {
            if let Ok(n) = v.parse() {
                config.retry_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("PGPUBSUB_ACQUIRE_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                config.acquire_interval_ms = n;
            }
        }

        config.connection = ConnectionConfig::from_env();

        config
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn acquire_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_interval_ms)
    }
}

/// Driver-specific connection parameters.
///
/// `conn_str`, if set, takes precedence over the discrete fields (mirroring
/// how most libpq-based clients accept either a URI or individual params).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Full `postgres://` connection string. Overrides the fields below when set.
    pub conn_str: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            conn_str: None,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: None,
        }
    }
}

impl ConnectionConfig {
    fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(uri) = std::env::var("DATABASE_URL") {
            config.conn_str = Some(uri);
        }
        if let Ok(v) = std::env::var("PGPUBSUB_DB_HOST") {
            config.host = v;
        }
        if let Ok(v) = std::env::var("PGPUBSUB_DB_PORT") {
            if let Ok(p) = v.parse() {
                config.port = p;
            }
        }
        if let Ok(v) = std::env::var("PGPUBSUB_DB_NAME") {
            config.database = v;
        }
        if let Ok(v) = std::env::var("PGPUBSUB_DB_USER") {
            config.user = v;
        }
        if let Ok(v) = std::env::var("PGPUBSUB_DB_PASSWORD") {
            config.password = Some(v);
        }

        config
    }

    /// Render as a `postgres://` connection string, unless `conn_str` was
    /// set explicitly.
    pub fn to_conn_string(&self) -> String {
        if let Some(conn_str) = &self.conn_str {
            return conn_str.clone();
        }

        let mut uri = format!("host={} port={} dbname={} user={}", self.host, self.port, self.database, self.user);
        if let Some(password) = &self.password {
            uri.push_str(&format!(" password={password}"));
        }
        uri
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_limit() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_acquire_interval_ms() -> u64 {
    1_000
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = PubSubOptions::default();
        assert!(opts.single_listener);
        assert_eq!(opts.retry_limit, 5);
        assert_eq!(opts.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn conn_str_overrides_discrete_fields() {
        let mut config = ConnectionConfig::default();
        config.conn_str = Some("postgres://example".to_string());
        assert_eq!(config.to_conn_string(), "postgres://example");
    }

    #[test]
    fn discrete_fields_build_a_conninfo_string() {
        let config = ConnectionConfig::default();
        assert_eq!(
            config.to_conn_string(),
            "host=localhost port=5432 dbname=postgres user=postgres"
        );
    }
}
