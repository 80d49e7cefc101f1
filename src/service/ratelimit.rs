//! Sliding-window admission control over a shared counter store.
//!
//! The window is a per-client sorted set of request timestamps. Each check
//! runs one atomic batch against the store: trim entries older than the
//! window, insert the current timestamp, count what remains, refresh the
//! key's expiry. Two concurrent requests can therefore never both observe a
//! stale count. A store failure rejects the request (fail closed).

use crate::error::BisubError;
use async_trait::async_trait;
use chrono::Utc;
use moka::sync::Cache;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Shared counter store with atomic batched trim/insert/count/expire
/// semantics. Substitutable for any keyed ordered-set service.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Applies the whole batch as one indivisible unit and returns how many
    /// timestamps remain inside the window (including the one just added).
    async fn slide(&self, key: &str, now: i64, window_secs: u64) -> Result<u64, BisubError>;
}

/// In-memory window store: per-key ordered timestamps behind a mutex, key
/// expiry handled by the cache's idle eviction.
pub struct MemoryWindowStore {
    cache: Cache<String, Arc<Mutex<VecDeque<i64>>>>,
}

impl MemoryWindowStore {
    pub fn new(window_secs: u64) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_idle(Duration::from_secs(window_secs))
                .build(),
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn slide(&self, key: &str, now: i64, window_secs: u64) -> Result<u64, BisubError> {
        let entry = self
            .cache
            .get_with(key.to_string(), || Arc::new(Mutex::new(VecDeque::new())));

        // The per-key mutex makes trim+insert+count indivisible; touching
        // the cache entry above refreshed its expiry.
        let mut window = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cutoff = now - i64::try_from(window_secs).unwrap_or(i64::MAX);
        while window.front().is_some_and(|ts| *ts <= cutoff) {
            window.pop_front();
        }
        window.push_back(now);
        Ok(window.len() as u64)
    }
}

/// Outcome of one admission check. Metadata is present whether or not the
/// request was admitted; `remaining` goes negative when over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: i64,
    /// Unix seconds at which the current window resets.
    pub reset: i64,
}

impl Admission {
    /// Collapses a denial into the caller-facing error, using the window
    /// length as the advertised retry-after.
    pub fn into_result(self, window_secs: u64) -> Result<Admission, BisubError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(BisubError::RateLimited {
                retry_after_secs: window_secs,
            })
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    limit: u64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, limit: u64, window_secs: u64) -> Self {
        Self {
            store,
            limit,
            window_secs,
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Runs the sliding-window batch for `client_key` and decides admission.
    /// Store failures reject the request rather than admitting it.
    pub async fn check(&self, client_key: &str) -> Result<Admission, BisubError> {
        let key = format!("rate_limit:{client_key}");
        let now = Utc::now().timestamp();

        let count = match self.store.slide(&key, now, self.window_secs).await {
            Ok(count) => count,
            Err(err) => {
                warn!(client = client_key, error = %err, "rate limit store failed, rejecting");
                return Err(BisubError::StorageUnavailable(format!(
                    "rate limit check failed: {err}"
                )));
            }
        };

        Ok(Admission {
            allowed: count <= self.limit,
            limit: self.limit,
            remaining: i64::try_from(self.limit).unwrap_or(i64::MAX)
                - i64::try_from(count).unwrap_or(i64::MAX),
            reset: now + i64::try_from(self.window_secs).unwrap_or(0),
        })
    }

    /// `check` plus the denial-to-error collapse, for callers that want the
    /// admission gate as a single fallible step.
    pub async fn admit(&self, client_key: &str) -> Result<Admission, BisubError> {
        self.check(client_key).await?.into_result(self.window_secs)
    }
}
