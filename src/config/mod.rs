//! Application configuration managed by Figment.
//!
//! Defaults are merged with an optional `config.toml`; every section can be
//! partially overridden. The core is a library, so nothing here binds
//! sockets; the `server` table only carries execution-side knobs.

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Execution defaults (see `server` table in config.toml).
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary store and named data sources (see `database` table).
    #[serde(default)]
    pub database: DatabaseConfig,

    /// SQL allow-listing (see `security` table).
    #[serde(default)]
    pub security: SecurityConfig,

    /// Distributed ID generation (see `snowflake` table).
    #[serde(default)]
    pub snowflake: SnowflakeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Log level handed to the tracing subscriber when `RUST_LOG` is unset.
    /// TOML: `server.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Default statement deadline in milliseconds when the caller sends none
    /// (or zero). TOML: `server.timeout_ms`. Default: `120000`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Requests admitted per client within one sliding window.
    /// TOML: `server.rate_limit`. Default: `100`.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,

    /// Sliding window length in seconds. TOML: `server.window_secs`.
    /// Default: `60`.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            timeout_ms: default_timeout_ms(),
            rate_limit: default_rate_limit(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary store holding subscriptions and execution stats.
    /// TOML: `database.primary`. Default URL: `sqlite://bisub.db`.
    #[serde(default)]
    pub primary: DbConfig,

    /// Logical name -> connection settings for report execution targets.
    /// The name `"default"` is what executions fall back to.
    /// TOML: `database.data_sources.<name>`.
    #[serde(default)]
    pub data_sources: HashMap<String, DbConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary: DbConfig::default(),
            data_sources: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    /// Connection URL (SQLite-first, e.g. `sqlite://bisub.db`).
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Pool ceiling. TOML: `max_connections`. Default: `8`.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Seconds to wait for a pooled connection. Default: `5`.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Seconds a pooled connection may live. Default: `1800`.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Leading keywords a stored template may start with, checked
    /// case-insensitively after comment stripping.
    /// TOML: `security.allowed_sql_prefixes`.
    #[serde(default = "default_allowed_sql_prefixes")]
    pub allowed_sql_prefixes: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_sql_prefixes: default_allowed_sql_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnowflakeConfig {
    /// Node identifier, 0..=1023. Operators must keep this unique per
    /// process; the core does not negotiate node IDs.
    /// TOML: `snowflake.node_id`. Default: `0`.
    #[serde(default)]
    pub node_id: u16,

    /// Capacity of the pre-generated ID pool. TOML: `snowflake.pool_size`.
    /// Default: `128`.
    #[serde(default = "default_id_pool_size")]
    pub pool_size: usize,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            pool_size: default_id_pool_size(),
        }
    }
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    pub fn from_optional_toml() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_rate_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_database_url() -> String {
    "sqlite://bisub.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_allowed_sql_prefixes() -> Vec<String> {
    ["SELECT", "WITH", "SHOW", "DESC", "EXPLAIN"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_id_pool_size() -> usize {
    128
}
