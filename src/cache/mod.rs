// src/cache/mod.rs

//! Last-known-good snapshot of the dashboard.
//!
//! One well-known slot, overwritten on every committed pipeline and read back
//! only when the live pipeline fails. A stored snapshot is only ever returned
//! for the exact `(strategy, selected_date)` it was written for.

use crate::models::{
    MarketInsight, MarketOverview, SnapshotContext, StockCandidate, StrategyKind,
};
use crate::traits::{SharedSnapshotStore, SnapshotStore};
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Key of the dashboard snapshot slot.
pub const SNAPSHOT_KEY: &str = "dailystock:latestDashboardPayload";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// Snapshot Types
// =============================================================================

/// What a committed pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub effective_date: NaiveDate,
    pub overview: MarketOverview,
    pub candidates: Vec<StockCandidate>,
    #[serde(default)]
    pub intraday_extra: Vec<StockCandidate>,
    #[serde(default)]
    pub insight: Option<MarketInsight>,
}

/// The persisted slot: payload plus the context it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub strategy: StrategyKind,
    pub selected_date: NaiveDate,
    #[serde(flatten)]
    pub payload: SnapshotPayload,
}

impl CacheSnapshot {
    pub fn context(&self) -> SnapshotContext {
        SnapshotContext {
            strategy: self.strategy,
            selected_date: self.selected_date,
        }
    }
}

/// Why a read produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMiss {
    Empty,
    ContextMismatch,
    Unreadable,
}

// =============================================================================
// Snapshot Cache
// =============================================================================

#[derive(Clone)]
pub struct SnapshotCache {
    store: SharedSnapshotStore,
    key: String,
}

impl SnapshotCache {
    pub fn new(store: SharedSnapshotStore) -> Self {
        Self::with_key(store, SNAPSHOT_KEY)
    }

    pub fn with_key(store: SharedSnapshotStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Returns the slot iff it was written for `context`.
    pub async fn read_snapshot(
        &self,
        context: SnapshotContext,
    ) -> Result<SnapshotPayload, SnapshotMiss> {
        let raw = match self.store.load(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(SnapshotMiss::Empty),
            Err(e) => {
                warn!("SnapshotCache: read failed, treating as empty: {}", e);
                return Err(SnapshotMiss::Unreadable);
            }
        };

        let snapshot: CacheSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!("SnapshotCache: stored slot is not a snapshot: {}", e);
                return Err(SnapshotMiss::Unreadable);
            }
        };

        if snapshot.context() != context {
            debug!(
                "SnapshotCache: slot holds {}/{}, wanted {}/{}",
                snapshot.strategy, snapshot.selected_date, context.strategy, context.selected_date
            );
            return Err(SnapshotMiss::ContextMismatch);
        }

        Ok(snapshot.payload)
    }

    /// Overwrites the slot.
    pub async fn write_snapshot(
        &self,
        context: SnapshotContext,
        payload: SnapshotPayload,
    ) -> Result<(), CacheError> {
        let snapshot = CacheSnapshot {
            strategy: context.strategy,
            selected_date: context.selected_date,
            payload,
        };
        let raw = serde_json::to_string(&snapshot)?;
        self.store.save(&self.key, &raw).await
    }
}

// =============================================================================
// Stores
// =============================================================================

/// One JSON file per key under a cache directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    /// Keeps concurrent saves off each other's temp files.
    tmp_seq: AtomicU64,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn shared(dir: impl AsRef<Path>) -> SharedSnapshotStore {
        Arc::new(Self::new(dir))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.tmp", seq));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes a raw value, bypassing serialization.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.put_raw(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(strategy: StrategyKind, day: u32) -> SnapshotContext {
        SnapshotContext {
            strategy,
            selected_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
        }
    }

    fn payload(code: &str) -> SnapshotPayload {
        SnapshotPayload {
            effective_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            overview: MarketOverview {
                up: 1,
                ..Default::default()
            },
            candidates: vec![StockCandidate {
                code: code.to_string(),
                change_rate: 1.5,
                ..Default::default()
            }],
            intraday_extra: Vec::new(),
            insight: None,
        }
    }

    #[tokio::test]
    async fn test_write_then_read_same_context() {
        let cache = SnapshotCache::new(MemorySnapshotStore::shared());
        let c = ctx(StrategyKind::Close, 10);
        cache.write_snapshot(c, payload("005930")).await.unwrap();
        assert_eq!(cache.read_snapshot(c).await, Ok(payload("005930")));
    }

    #[tokio::test]
    async fn test_mismatched_context_misses() {
        let cache = SnapshotCache::new(MemorySnapshotStore::shared());
        cache
            .write_snapshot(ctx(StrategyKind::Close, 10), payload("005930"))
            .await
            .unwrap();

        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Premarket, 10)).await,
            Err(SnapshotMiss::ContextMismatch)
        );
        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Close, 9)).await,
            Err(SnapshotMiss::ContextMismatch)
        );
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = SnapshotCache::new(MemorySnapshotStore::shared());
        cache
            .write_snapshot(ctx(StrategyKind::Close, 10), payload("A"))
            .await
            .unwrap();
        cache
            .write_snapshot(ctx(StrategyKind::Intraday, 10), payload("B"))
            .await
            .unwrap();

        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Close, 10)).await,
            Err(SnapshotMiss::ContextMismatch)
        );
        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Intraday, 10)).await,
            Ok(payload("B"))
        );
    }

    #[tokio::test]
    async fn test_empty_and_garbage_slots() {
        let store = MemorySnapshotStore::shared();
        let cache = SnapshotCache::new(store.clone());
        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Close, 10)).await,
            Err(SnapshotMiss::Empty)
        );

        store.put_raw(SNAPSHOT_KEY, "{not json");
        assert_eq!(
            cache.read_snapshot(ctx(StrategyKind::Close, 10)).await,
            Err(SnapshotMiss::Unreadable)
        );
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(FileSnapshotStore::shared(dir.path().join("nested")));
        let c = ctx(StrategyKind::Intraday, 10);

        assert_eq!(cache.read_snapshot(c).await, Err(SnapshotMiss::Empty));
        cache.write_snapshot(c, payload("000660")).await.unwrap();
        assert_eq!(cache.read_snapshot(c).await, Ok(payload("000660")));
        assert!(dir
            .path()
            .join("nested")
            .join("dailystock_latestDashboardPayload.json")
            .exists());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_saves_leave_one_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(FileSnapshotStore::shared(dir.path()));
        let c = ctx(StrategyKind::Close, 10);

        let (a, b) = tokio::join!(
            cache.write_snapshot(c, payload("005930")),
            cache.write_snapshot(c, payload("000660")),
        );
        a.unwrap();
        b.unwrap();

        let stored = cache.read_snapshot(c).await.unwrap();
        assert!(stored == payload("005930") || stored == payload("000660"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = CacheSnapshot {
            strategy: StrategyKind::Close,
            selected_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            payload: payload("005930"),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["strategy"], "close");
        assert_eq!(json["selectedDate"], "2025-01-10");
        assert_eq!(json["effectiveDate"], "2025-01-10");
        assert_eq!(json["candidates"][0]["code"], "005930");
    }
}
