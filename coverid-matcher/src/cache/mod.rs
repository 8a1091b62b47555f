//! Feature/result cache
//!
//! Process-wide cache of descriptor sets and per-detector comparison results,
//! shared by every session. Two layers:
//! - durable: the `feature_cache` SQLite table, source of truth, survives restarts
//! - memory: bounded LRU hot layer, best effort
//!
//! `get_or_compute` is single-flight: concurrent callers for one key await
//! the same in-flight computation instead of repeating it. Values are opaque
//! byte blobs; `encode`/`decode` give the bincode representation used by the
//! pipeline.

pub mod fingerprint;
mod memory;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::db;
use memory::MemoryLayer;

type Flight = Arc<OnceCell<Arc<Vec<u8>>>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    /// Entry absent while running cache-only
    #[error("Cache miss for {0} (cache-only mode)")]
    Miss(String),

    /// Durable store unreachable or failing
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// Stored blob could not be (de)serialized
    #[error("Cache codec error: {0}")]
    Codec(String),
}

impl From<coverid_common::Error> for CacheError {
    fn from(err: coverid_common::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

/// Serialize a value for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Deserialize a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    bincode::deserialize(bytes).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Retention limits for the durable layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_memory_entries: usize,
    pub max_age_days: u32,
    pub max_size_bytes: u64,
}

impl From<&coverid_common::config::CacheConfig> for RetentionPolicy {
    fn from(config: &coverid_common::config::CacheConfig) -> Self {
        Self {
            max_memory_entries: config.max_memory_entries,
            max_age_days: config.max_age_days,
            max_size_bytes: config.max_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&coverid_common::config::CacheConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CacheStats {
    /// Durable entries
    pub entry_count: u64,
    /// Durable payload size
    pub size_bytes: u64,
    pub memory_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EvictionReport {
    pub expired: u64,
    pub trimmed: u64,
    /// Candidates for removal kept because their computation was in flight
    pub skipped_in_flight: u64,
}

pub struct FeatureCache {
    db: SqlitePool,
    policy: RetentionPolicy,
    memory: Mutex<MemoryLayer>,
    in_flight: Mutex<HashMap<String, Flight>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeatureCache {
    pub fn new(db: SqlitePool, policy: RetentionPolicy) -> Self {
        Self {
            db,
            policy,
            memory: Mutex::new(MemoryLayer::new(policy.max_memory_entries)),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    // Lock poisoning only follows a panic while holding the guard; the maps
    // stay structurally valid, so keep using them.
    fn memory(&self) -> MutexGuard<'_, MemoryLayer> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, Flight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached value for `key`, computing and storing it on a miss
    ///
    /// At most one computation per key runs at a time; other callers await
    /// it and receive the same value. A failed computation is not cached.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Arc<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.memory().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "Cache hit (memory)");
            return Ok(value);
        }

        let flight = self
            .flights()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut ran_init = false;
        let result = flight
            .get_or_try_init(|| {
                ran_init = true;
                self.load_or_compute(key, compute)
            })
            .await
            .cloned();

        if let Ok(value) = &result {
            // Publish to memory before retiring the flight so a new caller
            // always finds the value in one of the two places.
            self.memory().insert(key, value.clone());
            if !ran_init {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "Cache hit (awaited in-flight computation)");
            }
        }
        {
            let mut flights = self.flights();
            if flights
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &flight))
            {
                flights.remove(key);
            }
        }
        result
    }

    async fn load_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Arc<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = db::cache::get_entry(&self.db, key)
            .await
            .map_err(CacheError::from)?
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "Cache hit (durable)");
            return Ok(Arc::new(value));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "Cache miss, computing");
        let value = compute().await?;
        db::cache::put_entry(&self.db, key, &value)
            .await
            .map_err(CacheError::from)?;
        Ok(Arc::new(value))
    }

    /// Look up `key` without computing (cache-only mode)
    pub async fn get_existing(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        if let Some(value) = self.memory().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        let flight = self.flights().get(key).cloned();
        if let Some(value) = flight.as_ref().and_then(|f| f.get()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value.clone()));
        }

        match db::cache::get_entry(&self.db, key).await? {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let value = Arc::new(value);
                self.memory().insert(key, value.clone());
                Ok(Some(value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "Cache miss (lookup only)");
                Ok(None)
            }
        }
    }

    /// Remove one entry; true if the durable layer held it
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        self.memory().remove(key);
        let removed = db::cache::delete_entry(&self.db, key).await?;
        tracing::info!(key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.memory().remove_prefix(prefix);
        let removed = db::cache::delete_prefix(&self.db, prefix).await?;
        tracing::info!(prefix, removed, "Cache prefix invalidated");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<u64, CacheError> {
        self.memory().clear();
        let removed = db::cache::delete_all(&self.db).await?;
        tracing::info!(removed, "Cache cleared");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (entry_count, size_bytes) = db::cache::totals(&self.db).await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        Ok(CacheStats {
            entry_count,
            size_bytes,
            memory_entries: self.memory().len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            in_flight: self.flights().len(),
        })
    }

    /// Apply the retention policy to the durable layer
    ///
    /// Entries older than `max_age_days` go first, then least recently
    /// accessed entries until the total size fits `max_size_bytes`. Keys with
    /// a computation in flight are never removed.
    pub async fn evict_expired(&self) -> Result<EvictionReport, CacheError> {
        let cutoff = db::cache::cutoff_timestamp(
            Utc::now() - chrono::Duration::days(i64::from(self.policy.max_age_days)),
        );
        let entries = db::cache::list_by_access(&self.db).await?;
        let in_flight: HashSet<String> = self.flights().keys().cloned().collect();

        let mut report = EvictionReport::default();
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let mut doomed = Vec::new();

        for entry in &entries {
            if entry.created_at < cutoff {
                if in_flight.contains(&entry.key) {
                    report.skipped_in_flight += 1;
                    continue;
                }
                total = total.saturating_sub(entry.size_bytes);
                report.expired += 1;
                doomed.push(entry.key.clone());
            }
        }
        for entry in &entries {
            if total <= self.policy.max_size_bytes {
                break;
            }
            if entry.created_at < cutoff {
                continue;
            }
            if in_flight.contains(&entry.key) {
                report.skipped_in_flight += 1;
                continue;
            }
            total = total.saturating_sub(entry.size_bytes);
            report.trimmed += 1;
            doomed.push(entry.key.clone());
        }

        if !doomed.is_empty() {
            {
                let mut memory = self.memory();
                for key in &doomed {
                    memory.remove(key);
                }
            }
            db::cache::delete_keys(&self.db, &doomed).await?;
            tracing::info!(
                expired = report.expired,
                trimmed = report.trimmed,
                "Cache retention applied"
            );
        }
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn mark_in_flight(&self, key: &str) -> Flight {
        self.flights()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}
