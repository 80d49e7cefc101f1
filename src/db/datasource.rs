//! Static registry of report execution targets.
//!
//! Populated once from configuration at startup; executions look
//! connections up by logical name, with `"default"` as the conventional
//! fallback name.

use crate::config::{DatabaseConfig, DbConfig};
use crate::error::BisubError;
use ahash::HashMap;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_DATA_SOURCE: &str = "default";

pub struct DataSourceRegistry {
    pools: HashMap<String, SqlitePool>,
}

impl DataSourceRegistry {
    /// Connects every configured data source. A registry with no sources is
    /// valid; executions against it fail with `UnknownDataSource`.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, BisubError> {
        let mut pools = HashMap::default();
        for (name, db) in &cfg.data_sources {
            let pool = connect_pool(db).await?;
            info!(name = %name, url = %db.url, "data source connected");
            pools.insert(name.clone(), pool);
        }
        Ok(Self { pools })
    }

    /// Builds a registry from already-connected pools. Intended for wiring
    /// and tests where the pools are created elsewhere.
    pub fn from_pools(pools: HashMap<String, SqlitePool>) -> Self {
        Self { pools }
    }

    pub fn get(&self, name: &str) -> Result<&SqlitePool, BisubError> {
        self.pools.get(name).ok_or_else(|| BisubError::UnknownDataSource {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

async fn connect_pool(db: &DbConfig) -> Result<SqlitePool, BisubError> {
    let connect_opts = SqliteConnectOptions::from_str(&db.url)
        .map_err(BisubError::Database)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .acquire_timeout(Duration::from_secs(db.acquire_timeout_secs))
        .max_lifetime(Duration::from_secs(db.max_lifetime_secs))
        .connect_with(connect_opts)
        .await
        .map_err(BisubError::Database)
}
