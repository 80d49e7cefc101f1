//! Database module: models, schema, the store actor, and the data-source
//! registry.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows plus request payloads
//! - `schema.rs`: SQL DDL for initializing the primary store (SQLite-first)
//! - `store.rs`: the store actor owning the pool and all mutations
//! - `datasource.rs`: logical name -> execution-target connection pool

pub mod datasource;
pub mod models;
pub mod schema;
pub mod store;

pub use datasource::{DEFAULT_DATA_SOURCE, DataSourceRegistry};
pub use models::{
    ExtraConfig, ListFilter, NewStats, NewSubscription, RequestResponse, StatsAggregate,
    StatsQuery, Subscription, SubscriptionPage, SubscriptionPatch, SubscriptionStats,
    SubscriptionStatus,
};
pub use schema::SQLITE_INIT;
pub use store::{StoreArgs, StoreHandle, spawn};
