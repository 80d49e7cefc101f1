use bisub::config::{DatabaseConfig, DbConfig, SnowflakeConfig};
use bisub::db::{
    DataSourceRegistry, NewSubscription, StatsQuery, StoreArgs, StoreHandle, SubscriptionStatus,
};
use bisub::error::BisubError;
use bisub::service::{ExecuteRequest, Executor, SqlValue, TextualExpander};
use serde_json::json;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;

fn temp_db(prefix: &str) -> (String, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    prefix.hash(&mut hasher);
    let db_path = tmp_dir.join(format!("test_{}_{}.sqlite", prefix, hasher.finish()));
    let url = format!("sqlite:{}", db_path.to_str().unwrap());
    (url, db_path)
}

async fn cleanup(db_path: &std::path::Path) {
    let base = db_path.to_string_lossy();
    let _ = fs::remove_file(format!("{base}-wal")).await;
    let _ = fs::remove_file(format!("{base}-shm")).await;
    let _ = fs::remove_file(db_path).await;
}

struct Harness {
    store: StoreHandle,
    registry: Arc<DataSourceRegistry>,
    executor: Executor,
    primary_path: std::path::PathBuf,
    source_path: std::path::PathBuf,
}

impl Harness {
    async fn new(prefix: &str) -> Self {
        let (primary_url, primary_path) = temp_db(&format!("{prefix}_primary"));
        let (source_url, source_path) = temp_db(&format!("{prefix}_source"));

        let store = bisub::db::spawn(StoreArgs {
            db: DbConfig {
                url: primary_url,
                ..DbConfig::default()
            },
            snowflake: SnowflakeConfig::default(),
            allowed_sql_prefixes: vec!["SELECT".to_string(), "WITH".to_string()],
        })
        .await
        .unwrap();

        let mut data_sources = std::collections::HashMap::new();
        data_sources.insert(
            "default".to_string(),
            DbConfig {
                url: source_url,
                max_connections: 1,
                ..DbConfig::default()
            },
        );
        let registry = Arc::new(
            DataSourceRegistry::connect(&DatabaseConfig {
                primary: DbConfig::default(),
                data_sources,
            })
            .await
            .unwrap(),
        );

        // Seed the execution target.
        let pool = registry.get("default").unwrap();
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, name, score) VALUES (1, 'alice', 0.5), (2, 'bob', NULL)")
            .execute(pool)
            .await
            .unwrap();

        let executor = Executor::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::new(TextualExpander),
            120_000,
        );

        Self {
            store,
            registry,
            executor,
            primary_path,
            source_path,
        }
    }

    async fn create_subscription(&self, sub_key: &str, version: i64, status: SubscriptionStatus, sql: &str) {
        self.store
            .create(NewSubscription {
                id: None,
                sub_type: "A".to_string(),
                sub_key: sub_key.to_string(),
                version,
                title: format!("{sub_key} v{version}"),
                summary: "report".to_string(),
                status,
                created_by: 1,
                extra_config: serde_json::to_string(&json!({
                    "sql_content": sql,
                    "sql_replace": {"id_replace": "row id"},
                    "example": "id_replace=1",
                }))
                .unwrap(),
            })
            .await
            .unwrap();
    }

    fn request(&self, variables: HashMap<String, serde_json::Value>) -> ExecuteRequest {
        ExecuteRequest {
            sub_type: "A".to_string(),
            sub_key: "report1".to_string(),
            version: None,
            variables,
            timeout_ms: None,
            data_source: None,
            client_ip: "10.0.0.1".to_string(),
            request_url: "/api/subscriptions/A/report1/execute".to_string(),
        }
    }

    async fn teardown(self) {
        cleanup(&self.primary_path).await;
        cleanup(&self.source_path).await;
    }
}

fn vars(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn executes_template_and_decodes_typed_rows() {
    let h = Harness::new("exec_basic").await;
    h.create_subscription(
        "report1",
        1,
        SubscriptionStatus::Active,
        "SELECT id, name, score FROM users WHERE id = id_replace",
    )
    .await;

    let rows = h
        .executor
        .execute(h.request(vars(&[("id_replace", json!("1"))])))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("id"), Some(&SqlValue::Integer(1)));
    assert_eq!(row.get("name"), Some(&SqlValue::Text("alice".to_string())));
    assert_eq!(row.get("score"), Some(&SqlValue::Real(0.5)));

    // Column order follows the projection.
    let names: Vec<&str> = row.columns().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["id", "name", "score"]);

    h.teardown().await;
}

#[tokio::test]
async fn null_columns_decode_as_null() {
    let h = Harness::new("exec_null").await;
    h.create_subscription(
        "report1",
        1,
        SubscriptionStatus::Active,
        "SELECT name, score FROM users WHERE id = id_replace",
    )
    .await;

    let rows = h
        .executor
        .execute(h.request(vars(&[("id_replace", json!(2))])))
        .await
        .unwrap();
    assert_eq!(rows[0].get("score"), Some(&SqlValue::Null));

    h.teardown().await;
}

#[tokio::test]
async fn template_errors_surface_unchanged() {
    let h = Harness::new("exec_template_errors").await;
    h.create_subscription(
        "report1",
        1,
        SubscriptionStatus::Active,
        "SELECT * FROM users WHERE id = id_replace",
    )
    .await;

    let err = h.executor.execute(h.request(vars(&[]))).await.unwrap_err();
    assert!(matches!(err, BisubError::MissingVariable { ref name } if name == "id_replace"));

    let err = h
        .executor
        .execute(h.request(vars(&[("id_replace", json!("5 OR 1=1; --"))])))
        .await
        .unwrap_err();
    assert!(matches!(err, BisubError::UnsafeVariable { ref name } if name == "id_replace"));

    h.teardown().await;
}

#[tokio::test]
async fn unknown_subscription_and_data_source_are_reported() {
    let h = Harness::new("exec_unknown").await;

    let err = h.executor.execute(h.request(vars(&[]))).await.unwrap_err();
    assert!(matches!(err, BisubError::NotFound));

    h.create_subscription("report1", 1, SubscriptionStatus::Active, "SELECT 1 AS one")
        .await;
    let mut req = h.request(vars(&[]));
    req.data_source = Some("warehouse".to_string());
    let err = h.executor.execute(req).await.unwrap_err();
    assert!(matches!(err, BisubError::UnknownDataSource { ref name } if name == "warehouse"));

    h.teardown().await;
}

#[tokio::test]
async fn deadline_cancels_execution_with_no_partial_results() {
    let h = Harness::new("exec_timeout").await;
    h.create_subscription("report1", 1, SubscriptionStatus::Active, "SELECT 1 AS one")
        .await;

    // Hold the data source's only connection so the query cannot start
    // before the caller's deadline elapses.
    let pool = h.registry.get("default").unwrap().clone();
    let held = pool.acquire().await.unwrap();

    let mut req = h.request(vars(&[]));
    req.timeout_ms = Some(100);
    let err = h.executor.execute(req).await.unwrap_err();
    assert!(matches!(err, BisubError::Timeout { ms: 100 }), "got {err}");

    drop(held);
    h.teardown().await;
}

#[tokio::test]
async fn expired_pin_executes_the_superseding_version() {
    let h = Harness::new("exec_fallback").await;
    h.create_subscription(
        "report1",
        1,
        SubscriptionStatus::Active,
        "SELECT 'v1' AS tag",
    )
    .await;
    h.create_subscription(
        "report1",
        2,
        SubscriptionStatus::ActiveForceCompatible,
        "SELECT 'v2' AS tag",
    )
    .await;

    // Version 1 was demoted by the force-compatible create; the pinned
    // caller transparently runs version 2's template.
    let mut req = h.request(vars(&[]));
    req.version = Some(1);
    let rows = h.executor.execute(req).await.unwrap();
    assert_eq!(rows[0].get("tag"), Some(&SqlValue::Text("v2".to_string())));

    h.teardown().await;
}

#[tokio::test]
async fn successful_execution_records_stats_asynchronously() {
    let h = Harness::new("exec_stats").await;
    h.create_subscription(
        "report1",
        1,
        SubscriptionStatus::Active,
        "SELECT id FROM users WHERE id = id_replace",
    )
    .await;

    h.executor
        .execute(h.request(vars(&[("id_replace", json!("1"))])))
        .await
        .unwrap();

    // The recorder is detached; poll until it lands.
    let mut aggregates = Vec::new();
    for _ in 0..100 {
        aggregates = h
            .store
            .aggregate_stats(StatsQuery::default())
            .await
            .unwrap();
        if !aggregates.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(aggregates.len(), 1);
    let agg = &aggregates[0];
    assert_eq!(agg.sub_key, "report1");
    assert_eq!(agg.version, 1);
    assert_eq!(agg.call_count, 1);
    assert_eq!(agg.created_by, Some(1));
    let recorded_sql = agg.fastest_sql.as_deref().unwrap();
    assert_eq!(recorded_sql, "SELECT id FROM users WHERE id = 1");

    h.teardown().await;
}
