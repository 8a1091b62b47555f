//! Key/value settings (preset catalog)

use coverid_common::{Error, Result};
use sqlx::SqlitePool;

use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Settings key holding the JSON preset catalog
pub const PRESET_CATALOG_KEY: &str = "preset_catalog";

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    retry_on_lock("set_setting", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<_, Error>(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database_pool;

    #[tokio::test]
    async fn test_set_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("settings.db")).await.unwrap();

        assert_eq!(get_setting(&pool, "k").await.unwrap(), None);
        set_setting(&pool, "k", "v1").await.unwrap();
        set_setting(&pool, "k", "v2").await.unwrap();
        assert_eq!(get_setting(&pool, "k").await.unwrap(), Some("v2".to_string()));
    }
}
