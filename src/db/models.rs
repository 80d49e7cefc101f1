use crate::error::BisubError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// Lifecycle state of one subscription version, stored as a single-char code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum SubscriptionStatus {
    /// "A": created, not yet serving traffic.
    #[serde(rename = "A")]
    #[sqlx(rename = "A")]
    Pending,
    /// "B": the canonical current version for fallback resolution.
    #[serde(rename = "B")]
    #[sqlx(rename = "B")]
    Active,
    /// "C": serving, but excluded from default-version fallback; creating
    /// one retires older active versions of the same key.
    #[serde(rename = "C")]
    #[sqlx(rename = "C")]
    ActiveForceCompatible,
    /// "D": retired; never resolved.
    #[serde(rename = "D")]
    #[sqlx(rename = "D")]
    Expired,
}

impl SubscriptionStatus {
    pub fn as_code(self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "A",
            SubscriptionStatus::Active => "B",
            SubscriptionStatus::ActiveForceCompatible => "C",
            SubscriptionStatus::Expired => "D",
        }
    }
}

/// Template payload carried in a subscription's `extra_config` column.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExtraConfig {
    /// The stored report SQL, containing `<name>_replace` placeholders.
    pub sql_content: String,
    /// Placeholder name -> human description of the expected value.
    #[serde(default)]
    pub sql_replace: HashMap<String, String>,
    /// Example invocation shown in the admin surface.
    #[serde(default)]
    pub example: String,
}

/// One versioned report template. Identity is (type, sub_key, version).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub sub_type: String,
    pub sub_key: String,
    /// Small positive integer assigned by the creator, not the store.
    pub version: i64,
    pub title: String,
    #[serde(rename = "abstract")]
    #[sqlx(rename = "abstract")]
    pub summary: String,
    pub status: SubscriptionStatus,
    pub created_by: i64,
    /// JSON text holding an [`ExtraConfig`].
    pub extra_config: String,
}

impl Subscription {
    pub fn parse_extra_config(&self) -> Result<ExtraConfig, BisubError> {
        serde_json::from_str(&self.extra_config)
            .map_err(|err| BisubError::InvalidExtraConfig(err.to_string()))
    }
}

/// Payload for creating a subscription. `id` of zero/absent means the store
/// assigns one from the ID pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub sub_type: String,
    pub sub_key: String,
    pub version: i64,
    pub title: String,
    #[serde(rename = "abstract")]
    pub summary: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub created_by: i64,
    /// JSON text holding an [`ExtraConfig`]; validated before insert.
    pub extra_config: String,
}

impl NewSubscription {
    pub fn parse_extra_config(&self) -> Result<ExtraConfig, BisubError> {
        serde_json::from_str(&self.extra_config)
            .map_err(|err| BisubError::InvalidExtraConfig(err.to_string()))
    }
}

/// Partial update scoped to one (type, sub_key, version) row. `None` fields
/// are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub summary: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub extra_config: Option<String>,
}

impl SubscriptionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.status.is_none()
            && self.extra_config.is_none()
    }
}

/// Conjunctive list filters; `None` fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Substring match on `sub_key`.
    pub sub_key: Option<String>,
    /// Substring match on `title`.
    pub title: Option<String>,
    /// Exact status match.
    pub status: Option<SubscriptionStatus>,
}

/// One page of subscriptions plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPage {
    pub items: Vec<Subscription>,
    pub total: i64,
}

/// One execution record; created after a successful execution, never
/// updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct SubscriptionStats {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub sub_key: String,
    pub version: i64,
    /// Whole milliseconds from just before the data-source call to the end
    /// of row decoding.
    pub execution_duration: i64,
    pub request_url: String,
    /// JSON blob: variables, expanded SQL, data-source name, client IP,
    /// version.
    pub request_response: String,
    pub instance_source: String,
}

/// Stats payload as handed to the recorder; the store assigns id and
/// created_at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStats {
    pub sub_key: String,
    pub version: i64,
    pub execution_duration: i64,
    pub request_url: String,
    pub request_response: String,
    pub instance_source: String,
}

/// Detail blob embedded in [`SubscriptionStats::request_response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResponse {
    pub params: serde_json::Value,
    pub instance_sql: String,
    pub instance_source: String,
    pub request_ip: String,
    pub version: i64,
}

/// Per-(sub_key, version) execution aggregate over a time range.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatsAggregate {
    pub sub_key: String,
    pub version: i64,
    pub call_count: i64,
    pub avg_execution_time: f64,
    pub min_execution_time: i64,
    pub max_execution_time: i64,
    pub fastest_sql: Option<String>,
    pub slowest_sql: Option<String>,
    pub created_by: Option<i64>,
}

/// Time range and paging for stats aggregation; `None` bounds default to
/// the trailing seven days.
#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}
