//! SQL DDL for initializing the primary store.
//! SQLite-first design; can be adapted for other RDBMS.

/// Schema includes:
/// - `sub_subscription_theme`: versioned report templates, one
///   (type, sub_key, version) per row
/// - `sub_logs_bidata_response`: append-only execution stats
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Subscription themes (one (type, sub_key, version) per row)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sub_subscription_theme (
    id INTEGER PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL, -- RFC3339
    type TEXT NOT NULL DEFAULT '',
    sub_key TEXT NOT NULL DEFAULT '',
    version INTEGER NOT NULL DEFAULT 1,
    title TEXT NOT NULL,
    abstract TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    created_by INTEGER NOT NULL DEFAULT 0,
    extra_config TEXT NOT NULL,
    UNIQUE(type, sub_key, version)
);

CREATE INDEX IF NOT EXISTS idx_subscription_key_status
    ON sub_subscription_theme(type, sub_key, status);

-- ---------------------------------------------------------------------------
-- Execution stats (write-once)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sub_logs_bidata_response (
    id INTEGER PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    sub_key TEXT NOT NULL DEFAULT '',
    version INTEGER NOT NULL DEFAULT 1,
    execution_duration INTEGER NOT NULL DEFAULT 0, -- milliseconds
    request_url TEXT NOT NULL DEFAULT '',
    request_response TEXT NOT NULL,
    instance_source TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_stats_key_version_created
    ON sub_logs_bidata_response(sub_key, version, created_at);
"#;
