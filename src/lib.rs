//! Core of a versioned SQL report ("subscription") service.
//!
//! Four tightly coupled pieces live here, resting on a SQLite-backed store:
//! a versioned subscription store with a status state machine, a
//! template-based ad-hoc SQL execution engine, a sliding-window rate
//! limiter over a shared counter store, and a snowflake-style ID generator
//! with a pre-fetch pool. The HTTP surface, admin UI, and auth are external
//! collaborators that call into [`service::Executor`] and
//! [`db::StoreHandle`].

pub mod config;
pub mod db;
pub mod error;
pub mod service;
pub mod utils;

pub use error::BisubError;

use crate::db::datasource::DataSourceRegistry;
use crate::db::store::{StoreArgs, StoreHandle};
use crate::service::executor::Executor;
use crate::service::ratelimit::{MemoryWindowStore, RateLimiter};
use crate::service::template::TextualExpander;
use std::sync::Arc;

/// Fully wired core: store, coordinator, and admission gate.
pub struct Core {
    pub store: StoreHandle,
    pub executor: Arc<Executor>,
    pub limiter: Arc<RateLimiter>,
}

/// Wires the core from configuration: spawns the store actor, connects the
/// data-source registry, and builds the executor and limiter.
pub async fn init(cfg: &config::Config) -> Result<Core, BisubError> {
    let store = db::store::spawn(StoreArgs {
        db: cfg.database.primary.clone(),
        snowflake: cfg.snowflake.clone(),
        allowed_sql_prefixes: cfg.security.allowed_sql_prefixes.clone(),
    })
    .await?;

    let data_sources = Arc::new(DataSourceRegistry::connect(&cfg.database).await?);

    let executor = Arc::new(Executor::new(
        store.clone(),
        data_sources,
        Arc::new(TextualExpander),
        cfg.server.timeout_ms,
    ));

    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryWindowStore::new(cfg.server.window_secs)),
        cfg.server.rate_limit,
        cfg.server.window_secs,
    ));

    Ok(Core {
        store,
        executor,
        limiter,
    })
}
