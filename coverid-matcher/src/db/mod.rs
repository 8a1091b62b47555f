//! SQLite persistence for coverid-matcher
//!
//! Sessions (with their inputs and per-image outcomes), the durable layer of
//! the feature cache and the preset settings all live in `coverid.db` under
//! the root folder.

pub mod cache;
pub mod inputs;
pub mod items;
pub mod sessions;
pub mod settings;

use chrono::{DateTime, SecondsFormat, Utc};
use coverid_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "coverid.db";

const MAX_CONNECTIONS: u32 = 8;

/// Open (creating if needed) the database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;
    Ok(pool)
}

/// Create coverid tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_sessions (
            session_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            started_by TEXT NOT NULL,
            replay_of TEXT,
            replayed_by TEXT,
            evaluation_group TEXT,
            total_items INTEGER NOT NULL,
            processed_items INTEGER NOT NULL DEFAULT 0,
            successful_items INTEGER NOT NULL DEFAULT 0,
            failed_items INTEGER NOT NULL DEFAULT 0,
            percentage_complete INTEGER NOT NULL DEFAULT 0,
            current_stage TEXT NOT NULL DEFAULT '',
            status_message TEXT NOT NULL DEFAULT '',
            error_message TEXT,
            preset_name TEXT NOT NULL,
            preset TEXT NOT NULL,
            target TEXT NOT NULL,
            best_similarity REAL,
            evaluation TEXT,
            time_started TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            time_finished TEXT,
            revision INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_match_sessions_started ON match_sessions(time_started)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_inputs (
            session_id TEXT NOT NULL,
            item_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            image BLOB NOT NULL,
            PRIMARY KEY (session_id, item_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_items (
            session_id TEXT NOT NULL,
            item_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            stage TEXT NOT NULL,
            outcome TEXT,
            PRIMARY KEY (session_id, item_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_cache (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            last_accessed TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (settings, match_sessions, session_inputs, session_items, feature_cache)"
    );
    Ok(())
}

/// Fixed-width UTC timestamp; lexicographic order equals time order
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", what, e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(what: &str, value: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        use chrono::SubsecRound;

        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);
        let a = format_timestamp(earlier);
        let b = format_timestamp(later);
        assert!(a < b);
        assert!(a.ends_with('Z'));
        assert_eq!(parse_timestamp("t", &a).unwrap(), earlier.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn test_init_creates_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("nested").join(DATABASE_FILE_NAME))
            .await
            .unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for table in [
            "feature_cache",
            "match_sessions",
            "session_inputs",
            "session_items",
            "settings",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing {}", table);
        }

        // Idempotent
        init_tables(&pool).await.unwrap();
    }
}
