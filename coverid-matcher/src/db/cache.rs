//! Durable layer of the feature cache

use chrono::{DateTime, Utc};
use coverid_common::{Error, Result};
use sqlx::{Row, SqlitePool};

use super::format_timestamp;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Metadata of one durable cache entry, used for retention decisions
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryMeta {
    pub key: String,
    pub size_bytes: u64,
    pub created_at: String,
    pub last_accessed: String,
}

/// Fetch a value and refresh its access time
pub async fn get_entry(pool: &SqlitePool, key: &str) -> Result<Option<Vec<u8>>> {
    let value: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT value FROM feature_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    if value.is_some() {
        let now = format_timestamp(Utc::now());
        retry_on_lock("touch_cache_entry", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query("UPDATE feature_cache SET last_accessed = ? WHERE key = ?")
                .bind(&now)
                .bind(key)
                .execute(pool)
                .await
                .map_err(Error::Database)?;
            Ok::<_, Error>(())
        })
        .await?;
    }
    Ok(value)
}

/// Insert a value unless the key already exists (first writer wins)
///
/// Returns true when this call stored the value.
pub async fn put_entry(pool: &SqlitePool, key: &str, value: &[u8]) -> Result<bool> {
    let now = format_timestamp(Utc::now());
    let size_bytes = value.len() as i64;

    retry_on_lock("put_cache_entry", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO feature_cache (key, value, size_bytes, created_at, last_accessed)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(size_bytes)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<_, Error>(result.rows_affected() > 0)
    })
    .await
}

pub async fn delete_entry(pool: &SqlitePool, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM feature_cache WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete every entry whose key starts with `prefix`
pub async fn delete_prefix(pool: &SqlitePool, prefix: &str) -> Result<u64> {
    // substr comparison avoids LIKE wildcard escaping
    let result = sqlx::query("DELETE FROM feature_cache WHERE substr(key, 1, ?) = ?")
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM feature_cache")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Delete the given keys in one transaction
pub async fn delete_keys(pool: &SqlitePool, keys: &[String]) -> Result<u64> {
    if keys.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut removed = 0;
    for key in keys {
        removed += sqlx::query("DELETE FROM feature_cache WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

/// (entry count, total size in bytes)
pub async fn totals(pool: &SqlitePool) -> Result<(u64, u64)> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS size FROM feature_cache",
    )
    .fetch_one(pool)
    .await?;
    Ok((
        row.get::<i64, _>("entries").max(0) as u64,
        row.get::<i64, _>("size").max(0) as u64,
    ))
}

/// All entries, least recently accessed first
pub async fn list_by_access(pool: &SqlitePool) -> Result<Vec<CacheEntryMeta>> {
    let rows = sqlx::query(
        "SELECT key, size_bytes, created_at, last_accessed FROM feature_cache ORDER BY last_accessed, key",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| CacheEntryMeta {
            key: row.get("key"),
            size_bytes: row.get::<i64, _>("size_bytes").max(0) as u64,
            created_at: row.get("created_at"),
            last_accessed: row.get("last_accessed"),
        })
        .collect())
}

/// Formatted cutoff comparable with `created_at` values
pub fn cutoff_timestamp(cutoff: DateTime<Utc>) -> String {
    format_timestamp(cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database_pool;
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("cache.db")).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (_dir, pool) = pool().await;
        assert!(put_entry(&pool, "desc/grid_hash/512/abc", b"one").await.unwrap());
        assert!(!put_entry(&pool, "desc/grid_hash/512/abc", b"two").await.unwrap());
        assert_eq!(
            get_entry(&pool, "desc/grid_hash/512/abc").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(totals(&pool).await.unwrap(), (1, 3));
    }

    #[tokio::test]
    async fn test_prefix_delete_is_literal() {
        let (_dir, pool) = pool().await;
        put_entry(&pool, "desc/grid_hash/512/a", b"x").await.unwrap();
        put_entry(&pool, "desc/color_histogram/512/a", b"x").await.unwrap();
        put_entry(&pool, "cmp/grid_hash/512/b", b"x").await.unwrap();
        // '_' must not act as a wildcard
        put_entry(&pool, "desc/gridXhash/512/c", b"x").await.unwrap();

        assert_eq!(delete_prefix(&pool, "desc/grid_hash/").await.unwrap(), 1);
        assert_eq!(delete_prefix(&pool, "desc/").await.unwrap(), 2);
        assert_eq!(totals(&pool).await.unwrap().0, 1);
        assert_eq!(delete_all(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_keys_and_listing() {
        let (_dir, pool) = pool().await;
        for key in ["k1", "k2", "k3"] {
            put_entry(&pool, key, b"abcd").await.unwrap();
        }
        let listed = list_by_access(&pool).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|e| e.size_bytes == 4));

        let removed = delete_keys(&pool, &["k1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(delete_entry(&pool, "k2").await.unwrap());
        assert!(!delete_entry(&pool, "k2").await.unwrap());
    }
}
