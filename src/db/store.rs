//! Subscription and stats persistence behind a single database actor.
//!
//! All primary-store access flows through one [`StoreActor`] holding the
//! SQLite pool; callers talk to it through the cloneable [`StoreHandle`].
//! The demotion+insert sequence for force-compatible creation runs inside
//! one transaction, so no resolver can observe the new row without the
//! demotions or vice versa.

use crate::config::{DbConfig, SnowflakeConfig};
use crate::db::models::{
    ListFilter, NewStats, NewSubscription, StatsAggregate, StatsQuery, Subscription,
    SubscriptionPage, SubscriptionPatch, SubscriptionStatus,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::BisubError;
use crate::service::template;
use crate::utils::{IdPool, SnowflakeGenerator};
use chrono::{Duration as ChronoDuration, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything the store actor needs at spawn time.
#[derive(Debug, Clone)]
pub struct StoreArgs {
    pub db: DbConfig,
    pub snowflake: SnowflakeConfig,
    /// Leading keywords a stored template may begin with; re-checked on
    /// every create and extra_config update.
    pub allowed_sql_prefixes: Vec<String>,
}

#[derive(Debug)]
pub enum StoreMessage {
    /// Create a subscription; assigns an ID when the payload carries none
    /// and demotes superseded versions for force-compatible creation.
    Create(NewSubscription, RpcReplyPort<Result<Subscription, BisubError>>),

    /// Exact-version lookup, or highest `Active` version when `version` is
    /// `None`.
    Resolve {
        sub_type: String,
        sub_key: String,
        version: Option<i64>,
        reply: RpcReplyPort<Result<Subscription, BisubError>>,
    },

    /// As `Resolve`, but an expired or missing pinned version falls back to
    /// the current active one. This is the execution-path lookup.
    ResolveWithFallback {
        sub_type: String,
        sub_key: String,
        version: Option<i64>,
        reply: RpcReplyPort<Result<Subscription, BisubError>>,
    },

    /// Patch exactly one (type, sub_key, version) row.
    UpdateFields {
        sub_type: String,
        sub_key: String,
        version: i64,
        patch: SubscriptionPatch,
        reply: RpcReplyPort<Result<(), BisubError>>,
    },

    /// Set the status of exactly one row.
    UpdateStatus {
        sub_type: String,
        sub_key: String,
        version: i64,
        status: SubscriptionStatus,
        reply: RpcReplyPort<Result<(), BisubError>>,
    },

    /// Delete exactly one row.
    Delete {
        sub_type: String,
        sub_key: String,
        version: i64,
        reply: RpcReplyPort<Result<(), BisubError>>,
    },

    /// One page plus the unpaged total, under conjunctive filters.
    List {
        filter: ListFilter,
        limit: i64,
        offset: i64,
        reply: RpcReplyPort<Result<SubscriptionPage, BisubError>>,
    },

    /// Append one execution record.
    InsertStats(NewStats, RpcReplyPort<Result<i64, BisubError>>),

    /// Per-(sub_key, version) aggregates over a time range.
    AggregateStats(StatsQuery, RpcReplyPort<Result<Vec<StatsAggregate>, BisubError>>),
}

#[derive(Clone)]
pub struct StoreHandle {
    actor: ActorRef<StoreMessage>,
}

impl StoreHandle {
    pub async fn create(&self, new: NewSubscription) -> Result<Subscription, BisubError> {
        ractor::call!(self.actor, StoreMessage::Create, new)
            .map_err(|e| BisubError::Ractor(format!("Store Create RPC failed: {e}")))?
    }

    pub async fn resolve(
        &self,
        sub_type: &str,
        sub_key: &str,
        version: Option<i64>,
    ) -> Result<Subscription, BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::Resolve {
            sub_type: sub_type.to_string(),
            sub_key: sub_key.to_string(),
            version,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store Resolve RPC failed: {e}")))?
    }

    pub async fn resolve_with_fallback(
        &self,
        sub_type: &str,
        sub_key: &str,
        version: Option<i64>,
    ) -> Result<Subscription, BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::ResolveWithFallback {
            sub_type: sub_type.to_string(),
            sub_key: sub_key.to_string(),
            version,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store ResolveWithFallback RPC failed: {e}")))?
    }

    pub async fn update_fields(
        &self,
        sub_type: &str,
        sub_key: &str,
        version: i64,
        patch: SubscriptionPatch,
    ) -> Result<(), BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::UpdateFields {
            sub_type: sub_type.to_string(),
            sub_key: sub_key.to_string(),
            version,
            patch,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store UpdateFields RPC failed: {e}")))?
    }

    pub async fn update_status(
        &self,
        sub_type: &str,
        sub_key: &str,
        version: i64,
        status: SubscriptionStatus,
    ) -> Result<(), BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::UpdateStatus {
            sub_type: sub_type.to_string(),
            sub_key: sub_key.to_string(),
            version,
            status,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store UpdateStatus RPC failed: {e}")))?
    }

    pub async fn delete(
        &self,
        sub_type: &str,
        sub_key: &str,
        version: i64,
    ) -> Result<(), BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::Delete {
            sub_type: sub_type.to_string(),
            sub_key: sub_key.to_string(),
            version,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store Delete RPC failed: {e}")))?
    }

    pub async fn list(
        &self,
        filter: ListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<SubscriptionPage, BisubError> {
        ractor::call!(self.actor, |reply| StoreMessage::List {
            filter: filter.clone(),
            limit,
            offset,
            reply,
        })
        .map_err(|e| BisubError::Ractor(format!("Store List RPC failed: {e}")))?
    }

    pub async fn insert_stats(&self, stats: NewStats) -> Result<i64, BisubError> {
        ractor::call!(self.actor, StoreMessage::InsertStats, stats)
            .map_err(|e| BisubError::Ractor(format!("Store InsertStats RPC failed: {e}")))?
    }

    pub async fn aggregate_stats(
        &self,
        query: StatsQuery,
    ) -> Result<Vec<StatsAggregate>, BisubError> {
        ractor::call!(self.actor, StoreMessage::AggregateStats, query)
            .map_err(|e| BisubError::Ractor(format!("Store AggregateStats RPC failed: {e}")))?
    }
}

struct StoreState {
    pool: SqlitePool,
    ids: IdPool,
    allowed_sql_prefixes: Vec<String>,
}

struct StoreActor;

#[ractor::async_trait]
impl Actor for StoreActor {
    type Msg = StoreMessage;
    type State = StoreState;
    type Arguments = StoreArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(&args.db.url)
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(args.db.max_connections)
            .acquire_timeout(Duration::from_secs(args.db.acquire_timeout_secs))
            .max_lifetime(Duration::from_secs(args.db.max_lifetime_secs))
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        let generator = SnowflakeGenerator::new(args.snowflake.node_id)
            .map_err(|e| ActorProcessingErr::from(format!("snowflake init failed: {e}")))?;
        let ids = IdPool::new(Arc::new(generator), args.snowflake.pool_size);

        info!(node_id = args.snowflake.node_id, "StoreActor initialized");
        Ok(StoreState {
            pool,
            ids,
            allowed_sql_prefixes: args.allowed_sql_prefixes,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            StoreMessage::Create(new, reply) => {
                let res = create_subscription(state, new).await;
                let _ = reply.send(res);
            }
            StoreMessage::Resolve {
                sub_type,
                sub_key,
                version,
                reply,
            } => {
                let res = resolve(&state.pool, &sub_type, &sub_key, version).await;
                let _ = reply.send(res);
            }
            StoreMessage::ResolveWithFallback {
                sub_type,
                sub_key,
                version,
                reply,
            } => {
                let res = resolve_with_fallback(&state.pool, &sub_type, &sub_key, version).await;
                let _ = reply.send(res);
            }
            StoreMessage::UpdateFields {
                sub_type,
                sub_key,
                version,
                patch,
                reply,
            } => {
                let res = update_fields(state, &sub_type, &sub_key, version, patch).await;
                let _ = reply.send(res);
            }
            StoreMessage::UpdateStatus {
                sub_type,
                sub_key,
                version,
                status,
                reply,
            } => {
                let res = update_status(&state.pool, &sub_type, &sub_key, version, status).await;
                let _ = reply.send(res);
            }
            StoreMessage::Delete {
                sub_type,
                sub_key,
                version,
                reply,
            } => {
                let res = delete(&state.pool, &sub_type, &sub_key, version).await;
                let _ = reply.send(res);
            }
            StoreMessage::List {
                filter,
                limit,
                offset,
                reply,
            } => {
                let res = list(&state.pool, &filter, limit, offset).await;
                let _ = reply.send(res);
            }
            StoreMessage::InsertStats(stats, reply) => {
                let res = insert_stats(state, stats).await;
                let _ = reply.send(res);
            }
            StoreMessage::AggregateStats(query, reply) => {
                let res = aggregate_stats(&state.pool, query).await;
                let _ = reply.send(res);
            }
        }
        Ok(())
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, created_at, updated_at, type, sub_key, version, title, \
                                    abstract, status, created_by, extra_config";

async fn create_subscription(
    state: &StoreState,
    new: NewSubscription,
) -> Result<Subscription, BisubError> {
    // The payload must carry a well-formed template before anything hits
    // the store.
    let extra = new.parse_extra_config()?;
    template::validate_statement(&extra.sql_content, &state.allowed_sql_prefixes)?;

    let id = match new.id {
        Some(id) if id > 0 => id,
        _ => state.ids.get(),
    };
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;

    // Demotion and insert commit (or roll back) together; a partial
    // supersession is never observable.
    if new.status == SubscriptionStatus::ActiveForceCompatible {
        sqlx::query(
            r#"
        UPDATE sub_subscription_theme
        SET status = 'D', updated_at = ?
        WHERE type = ? AND sub_key = ? AND version < ? AND status IN ('B', 'C')
        "#,
        )
        .bind(now)
        .bind(&new.sub_type)
        .bind(&new.sub_key)
        .bind(new.version)
        .execute(&mut *tx)
        .await?;
    }

    let insert = sqlx::query(
        r#"
    INSERT INTO sub_subscription_theme (
        id, created_at, updated_at, type, sub_key, version, title, abstract, status, created_by, extra_config
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(&new.sub_type)
    .bind(&new.sub_key)
    .bind(new.version)
    .bind(&new.title)
    .bind(&new.summary)
    .bind(new.status)
    .bind(new.created_by)
    .bind(&new.extra_config)
    .execute(&mut *tx)
    .await;

    if let Err(err) = insert {
        tx.rollback().await.ok();
        return Err(match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => BisubError::Conflict(format!(
                "subscription ({}, {}, {}) already exists",
                new.sub_type, new.sub_key, new.version
            )),
            _ => BisubError::Database(err),
        });
    }

    tx.commit()
        .await
        .map_err(|e| BisubError::Conflict(format!("create transaction failed: {e}")))?;

    resolve(&state.pool, &new.sub_type, &new.sub_key, Some(new.version)).await
}

async fn resolve(
    pool: &SqlitePool,
    sub_type: &str,
    sub_key: &str,
    version: Option<i64>,
) -> Result<Subscription, BisubError> {
    let row = match version {
        Some(version) => {
            sqlx::query_as::<_, Subscription>(&format!(
                r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM sub_subscription_theme
            WHERE type = ? AND sub_key = ? AND version = ?
            "#,
            ))
            .bind(sub_type)
            .bind(sub_key)
            .bind(version)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Subscription>(&format!(
                r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM sub_subscription_theme
            WHERE type = ? AND sub_key = ? AND status = 'B'
            ORDER BY version DESC
            LIMIT 1
            "#,
            ))
            .bind(sub_type)
            .bind(sub_key)
            .fetch_optional(pool)
            .await?
        }
    };

    row.ok_or(BisubError::NotFound)
}

async fn resolve_with_fallback(
    pool: &SqlitePool,
    sub_type: &str,
    sub_key: &str,
    version: Option<i64>,
) -> Result<Subscription, BisubError> {
    let Some(version) = version else {
        return resolve(pool, sub_type, sub_key, None).await;
    };

    match resolve(pool, sub_type, sub_key, Some(version)).await {
        Ok(row) if row.status == SubscriptionStatus::Expired => {
            pinned_fallback(pool, sub_type, sub_key).await
        }
        Err(BisubError::NotFound) => pinned_fallback(pool, sub_type, sub_key).await,
        other => other,
    }
}

/// Where a retired or absent pinned version migrates to: the current active
/// version, or failing that the newest force-compatible one. Default (no
/// version) lookups never reach the second tier, which keeps
/// force-compatible rows out of "the" active resolution.
async fn pinned_fallback(
    pool: &SqlitePool,
    sub_type: &str,
    sub_key: &str,
) -> Result<Subscription, BisubError> {
    match resolve(pool, sub_type, sub_key, None).await {
        Err(BisubError::NotFound) => {
            sqlx::query_as::<_, Subscription>(&format!(
                r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM sub_subscription_theme
            WHERE type = ? AND sub_key = ? AND status = 'C'
            ORDER BY version DESC
            LIMIT 1
            "#,
            ))
            .bind(sub_type)
            .bind(sub_key)
            .fetch_optional(pool)
            .await?
            .ok_or(BisubError::NotFound)
        }
        other => other,
    }
}

async fn update_fields(
    state: &StoreState,
    sub_type: &str,
    sub_key: &str,
    version: i64,
    patch: SubscriptionPatch,
) -> Result<(), BisubError> {
    if let Some(extra_config) = &patch.extra_config {
        let extra: crate::db::models::ExtraConfig = serde_json::from_str(extra_config)
            .map_err(|err| BisubError::InvalidExtraConfig(err.to_string()))?;
        template::validate_statement(&extra.sql_content, &state.allowed_sql_prefixes)?;
    }

    let mut builder = sqlx::QueryBuilder::new("UPDATE sub_subscription_theme SET updated_at = ");
    builder.push_bind(Utc::now());
    if let Some(title) = &patch.title {
        builder.push(", title = ").push_bind(title);
    }
    if let Some(summary) = &patch.summary {
        builder.push(", abstract = ").push_bind(summary);
    }
    if let Some(status) = patch.status {
        builder.push(", status = ").push_bind(status);
    }
    if let Some(extra_config) = &patch.extra_config {
        builder.push(", extra_config = ").push_bind(extra_config);
    }
    builder.push(" WHERE type = ").push_bind(sub_type);
    builder.push(" AND sub_key = ").push_bind(sub_key);
    builder.push(" AND version = ").push_bind(version);

    let result = builder.build().execute(&state.pool).await?;
    if result.rows_affected() == 0 {
        return Err(BisubError::NotFound);
    }
    Ok(())
}

async fn update_status(
    pool: &SqlitePool,
    sub_type: &str,
    sub_key: &str,
    version: i64,
    status: SubscriptionStatus,
) -> Result<(), BisubError> {
    let result = sqlx::query(
        r#"
    UPDATE sub_subscription_theme
    SET status = ?, updated_at = ?
    WHERE type = ? AND sub_key = ? AND version = ?
    "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(sub_type)
    .bind(sub_key)
    .bind(version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BisubError::NotFound);
    }
    Ok(())
}

async fn delete(
    pool: &SqlitePool,
    sub_type: &str,
    sub_key: &str,
    version: i64,
) -> Result<(), BisubError> {
    let result = sqlx::query(
        r#"
    DELETE FROM sub_subscription_theme
    WHERE type = ? AND sub_key = ? AND version = ?
    "#,
    )
    .bind(sub_type)
    .bind(sub_key)
    .bind(version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BisubError::NotFound);
    }
    Ok(())
}

async fn list(
    pool: &SqlitePool,
    filter: &ListFilter,
    limit: i64,
    offset: i64,
) -> Result<SubscriptionPage, BisubError> {
    let limit = if (1..=100).contains(&limit) { limit } else { 20 };
    let offset = offset.max(0);

    let mut count_builder =
        sqlx::QueryBuilder::new("SELECT COUNT(*) FROM sub_subscription_theme WHERE 1 = 1");
    push_filters(&mut count_builder, filter);
    let total: i64 = count_builder.build_query_scalar().fetch_one(pool).await?;

    let mut select_builder = sqlx::QueryBuilder::new(format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM sub_subscription_theme WHERE 1 = 1"
    ));
    push_filters(&mut select_builder, filter);
    select_builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
    select_builder.push_bind(limit);
    select_builder.push(" OFFSET ");
    select_builder.push_bind(offset);

    let items = select_builder
        .build_query_as::<Subscription>()
        .fetch_all(pool)
        .await?;

    Ok(SubscriptionPage { items, total })
}

fn push_filters(builder: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, filter: &ListFilter) {
    if let Some(sub_key) = &filter.sub_key {
        builder
            .push(" AND sub_key LIKE ")
            .push_bind(format!("%{sub_key}%"));
    }
    if let Some(title) = &filter.title {
        builder
            .push(" AND title LIKE ")
            .push_bind(format!("%{title}%"));
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }
}

async fn insert_stats(state: &StoreState, stats: NewStats) -> Result<i64, BisubError> {
    let id = state.ids.get();
    sqlx::query(
        r#"
    INSERT INTO sub_logs_bidata_response (
        id, created_at, sub_key, version, execution_duration, request_url, request_response, instance_source
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(id)
    .bind(Utc::now())
    .bind(&stats.sub_key)
    .bind(stats.version)
    .bind(stats.execution_duration)
    .bind(&stats.request_url)
    .bind(&stats.request_response)
    .bind(&stats.instance_source)
    .execute(&state.pool)
    .await?;

    Ok(id)
}

async fn aggregate_stats(
    pool: &SqlitePool,
    query: StatsQuery,
) -> Result<Vec<StatsAggregate>, BisubError> {
    let end = query.end.unwrap_or_else(Utc::now);
    let start = query.start.unwrap_or(end - ChronoDuration::days(7));
    let limit = if (1..=100).contains(&query.limit) {
        query.limit
    } else {
        20
    };
    let offset = query.offset.max(0);

    let rows = sqlx::query_as::<_, StatsAggregate>(
        r#"
    SELECT
        s.sub_key,
        s.version,
        COUNT(*) AS call_count,
        AVG(s.execution_duration) AS avg_execution_time,
        MIN(s.execution_duration) AS min_execution_time,
        MAX(s.execution_duration) AS max_execution_time,
        (SELECT json_extract(request_response, '$.instance_sql') FROM sub_logs_bidata_response
         WHERE sub_key = s.sub_key AND version = s.version
           AND created_at BETWEEN ? AND ?
         ORDER BY execution_duration ASC LIMIT 1) AS fastest_sql,
        (SELECT json_extract(request_response, '$.instance_sql') FROM sub_logs_bidata_response
         WHERE sub_key = s.sub_key AND version = s.version
           AND created_at BETWEEN ? AND ?
         ORDER BY execution_duration DESC LIMIT 1) AS slowest_sql,
        sub.created_by
    FROM sub_logs_bidata_response s
    LEFT JOIN sub_subscription_theme sub
        ON s.sub_key = sub.sub_key AND s.version = sub.version
    WHERE s.created_at BETWEEN ? AND ?
    GROUP BY s.sub_key, s.version, sub.created_by
    ORDER BY avg_execution_time DESC
    LIMIT ? OFFSET ?
    "#,
    )
    .bind(start)
    .bind(end)
    .bind(start)
    .bind(end)
    .bind(start)
    .bind(end)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), BisubError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}

/// Spawn the store actor and return a cloneable handle.
pub async fn spawn(args: StoreArgs) -> Result<StoreHandle, BisubError> {
    let (actor, _jh) = Actor::spawn(None, StoreActor, args)
        .await
        .map_err(|e| BisubError::Ractor(format!("failed to spawn StoreActor: {e}")))?;

    Ok(StoreHandle { actor })
}
