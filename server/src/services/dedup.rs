//! Deduplication guards
//!
//! A guard remembers the last time a key was acquired within a scope and
//! refuses a second acquisition inside the window. Stores are pluggable so a
//! single instance can keep markers in memory while a multi-instance
//! deployment shares them through the database.

use crate::clock::SharedClock;
use crate::database::Repository;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Marker storage. Timestamps are milliseconds since the epoch.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically set `key` to `now_ms` unless it holds a marker newer than
    /// `cutoff_ms`. Returns whether the marker was set.
    async fn try_mark(&self, scope: &str, key: &str, now_ms: i64, cutoff_ms: i64) -> Result<bool>;

    async fn remove(&self, scope: &str, key: &str) -> Result<()>;

    /// Drop markers older than `older_than_ms`
    async fn purge(&self, scope: &str, older_than_ms: i64) -> Result<u64>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryDedupStore {
    markers: Mutex<HashMap<(String, String), i64>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.markers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.markers.lock().await.is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn try_mark(&self, scope: &str, key: &str, now_ms: i64, cutoff_ms: i64) -> Result<bool> {
        let mut markers = self.markers.lock().await;
        let entry = (scope.to_string(), key.to_string());

        match markers.get(&entry) {
            Some(marked) if *marked > cutoff_ms => Ok(false),
            _ => {
                markers.insert(entry, now_ms);
                Ok(true)
            }
        }
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        let mut markers = self.markers.lock().await;
        markers.remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }

    async fn purge(&self, scope: &str, older_than_ms: i64) -> Result<u64> {
        let mut markers = self.markers.lock().await;
        let before = markers.len();
        markers.retain(|(s, _), marked| s != scope || *marked >= older_than_ms);
        Ok((before - markers.len()) as u64)
    }
}

/// Store backed by the `dedup_markers` table
#[derive(Clone)]
pub struct SqlDedupStore {
    repo: Repository,
}

impl SqlDedupStore {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DedupStore for SqlDedupStore {
    async fn try_mark(&self, scope: &str, key: &str, now_ms: i64, cutoff_ms: i64) -> Result<bool> {
        self.repo.try_mark_dedup(scope, key, now_ms, cutoff_ms).await
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.repo.remove_dedup(scope, key).await
    }

    async fn purge(&self, scope: &str, older_than_ms: i64) -> Result<u64> {
        self.repo.purge_dedup(scope, older_than_ms).await
    }
}

/// Time-windowed guard over one scope
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
    clock: SharedClock,
    scope: &'static str,
    window: Duration,
    retention: Duration,
}

impl DedupGuard {
    pub fn new(
        store: Arc<dyn DedupStore>,
        clock: SharedClock,
        scope: &'static str,
        window: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            scope,
            window,
            retention,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Claim `key` for the window. Returns false when it was already claimed
    /// less than one window ago.
    pub async fn try_acquire(&self, key: &str) -> Result<bool> {
        let now_ms = self.clock.now().timestamp_millis();

        let purged = self
            .store
            .purge(self.scope, now_ms - self.retention.num_milliseconds())
            .await?;
        if purged > 0 {
            tracing::debug!("Purged {} stale {} markers", purged, self.scope);
        }

        let cutoff_ms = now_ms - self.window.num_milliseconds();
        let acquired = self.store.try_mark(self.scope, key, now_ms, cutoff_ms).await?;
        if !acquired {
            tracing::info!("Duplicate {} suppressed for {}", self.scope, key);
        }
        Ok(acquired)
    }

    /// Forget `key` so the next attempt is not treated as a duplicate
    pub async fn release(&self, key: &str) -> Result<()> {
        self.store.remove(self.scope, key).await
    }
}
