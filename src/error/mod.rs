use thiserror::Error as ThisError;

/// Unified error taxonomy for the subscription core.
///
/// Template/validation variants, `NotFound` and `UnknownDataSource` are
/// caller-input errors and carry enough detail to fix the request. `Timeout`
/// and `StorageUnavailable` are server-side failures the core never retries
/// on its own.
#[derive(Debug, ThisError)]
pub enum BisubError {
    #[error("subscription not found")]
    NotFound,

    #[error("subscription create conflict: {0}")]
    Conflict(String),

    #[error("SQL type not allowed, only {allowed:?} are permitted")]
    DisallowedStatement { allowed: Vec<String> },

    #[error("missing required variable: {name}")]
    MissingVariable { name: String },

    #[error("invalid variable value: {name}")]
    UnsafeVariable { name: String },

    #[error("data source {name} not found")]
    UnknownDataSource { name: String },

    #[error("SQL execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("too many requests, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("shared store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid extra_config: {0}")]
    InvalidExtraConfig(String),

    #[error("invalid snowflake ID: {0}")]
    InvalidId(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ractor error: {0}")]
    Ractor(String),
}

impl BisubError {
    /// True for errors caused by the caller's request payload.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BisubError::NotFound
                | BisubError::DisallowedStatement { .. }
                | BisubError::MissingVariable { .. }
                | BisubError::UnsafeVariable { .. }
                | BisubError::UnknownDataSource { .. }
                | BisubError::InvalidExtraConfig(_)
                | BisubError::InvalidId(_)
        )
    }
}
