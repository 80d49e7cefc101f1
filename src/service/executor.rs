//! Execution coordinator: resolve -> expand -> select data source ->
//! execute -> return, with a detached stats-recording branch.
//!
//! Stats persistence is best-effort, at-most-once: the caller's response
//! never waits on it and never sees its failures.

use crate::db::datasource::{DEFAULT_DATA_SOURCE, DataSourceRegistry};
use crate::db::models::{NewStats, RequestResponse};
use crate::db::store::StoreHandle;
use crate::error::BisubError;
use crate::service::template::TemplateExpander;
use crate::service::value::{ResultRow, decode_row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What the (external) HTTP layer hands the coordinator per execute call.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub sub_type: String,
    pub sub_key: String,
    /// Pinned version; expired or missing pins migrate to the current
    /// active version.
    pub version: Option<i64>,
    pub variables: HashMap<String, Value>,
    /// Statement deadline in milliseconds; `None` or zero means the server
    /// default.
    pub timeout_ms: Option<u64>,
    /// Logical data-source name; `None` means `"default"`.
    pub data_source: Option<String>,
    pub client_ip: String,
    pub request_url: String,
}

pub struct Executor {
    store: StoreHandle,
    data_sources: Arc<DataSourceRegistry>,
    expander: Arc<dyn TemplateExpander>,
    default_timeout_ms: u64,
}

impl Executor {
    pub fn new(
        store: StoreHandle,
        data_sources: Arc<DataSourceRegistry>,
        expander: Arc<dyn TemplateExpander>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            data_sources,
            expander,
            default_timeout_ms,
        }
    }

    /// Runs one subscription execution end to end and returns the decoded
    /// rows. Template and lookup errors surface unchanged; the deadline
    /// cancels the in-flight query and reports `Timeout` with no partial
    /// results.
    pub async fn execute(&self, req: ExecuteRequest) -> Result<Vec<ResultRow>, BisubError> {
        let subscription = self
            .store
            .resolve_with_fallback(&req.sub_type, &req.sub_key, req.version)
            .await?;
        let extra = subscription.parse_extra_config()?;

        let sql = self.expander.expand(&extra.sql_content, &req.variables)?;

        let source = req
            .data_source
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DATA_SOURCE);
        let pool = self.data_sources.get(source)?;

        let timeout_ms = match req.timeout_ms {
            Some(ms) if ms > 0 => ms,
            _ => self.default_timeout_ms,
        };

        debug!(
            sub_key = %subscription.sub_key,
            version = subscription.version,
            source = %source,
            timeout_ms,
            "executing subscription"
        );

        let started = Instant::now();
        let raw_rows = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            sqlx::query(&sql).fetch_all(pool),
        )
        .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => return Err(BisubError::Database(err)),
            Err(_elapsed) => return Err(BisubError::Timeout { ms: timeout_ms }),
        };

        let rows = raw_rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        self.record_stats(&req, &subscription.sub_key, subscription.version, &sql, source, duration_ms);

        Ok(rows)
    }

    /// Fire-and-forget stats persistence. Failure is logged and swallowed;
    /// the execution result is already on its way back to the caller.
    fn record_stats(
        &self,
        req: &ExecuteRequest,
        sub_key: &str,
        version: i64,
        sql: &str,
        source: &str,
        duration_ms: i64,
    ) {
        let detail = RequestResponse {
            params: Value::Object(
                req.variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            instance_sql: sql.to_string(),
            instance_source: source.to_string(),
            request_ip: req.client_ip.clone(),
            version,
        };
        let stats = NewStats {
            sub_key: sub_key.to_string(),
            version,
            execution_duration: duration_ms,
            request_url: req.request_url.clone(),
            request_response: serde_json::to_string(&detail)
                .unwrap_or_else(|_| "{}".to_string()),
            instance_source: source.to_string(),
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.insert_stats(stats).await {
                warn!(error = %err, "failed to record execution stats");
            }
        });
    }
}
