//! Per-image outcome persistence

use coverid_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{from_json, to_json};
use crate::models::{ImageItem, ItemOutcome, ItemStage};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

pub async fn save_item(pool: &SqlitePool, session_id: Uuid, item: &ImageItem) -> Result<()> {
    let session_id = session_id.to_string();
    let outcome = item
        .outcome
        .as_ref()
        .map(|o| to_json("item outcome", o))
        .transpose()?;

    retry_on_lock("save_item", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO session_items (session_id, item_index, name, fingerprint, stage, outcome)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, item_index) DO UPDATE SET
                stage = excluded.stage,
                outcome = excluded.outcome
            "#,
        )
        .bind(&session_id)
        .bind(item.index as i64)
        .bind(&item.name)
        .bind(&item.fingerprint)
        .bind(item.stage.as_str())
        .bind(&outcome)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<_, Error>(())
    })
    .await
}

/// Save every item of a new session in one transaction
pub async fn save_items(pool: &SqlitePool, session_id: Uuid, items: &[ImageItem]) -> Result<()> {
    let session_id = session_id.to_string();
    let outcomes = items
        .iter()
        .map(|item| {
            item.outcome
                .as_ref()
                .map(|o| to_json("item outcome", o))
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?;

    retry_on_lock("save_items", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (item, outcome) in items.iter().zip(&outcomes) {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO session_items
                    (session_id, item_index, name, fingerprint, stage, outcome)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&session_id)
            .bind(item.index as i64)
            .bind(&item.name)
            .bind(&item.fingerprint)
            .bind(item.stage.as_str())
            .bind(outcome)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok::<_, coverid_common::Error>(())
    })
    .await
}

/// Items of a session, ordered by index
pub async fn load_items(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<ImageItem>> {
    let rows = sqlx::query(
        r#"
        SELECT item_index, name, fingerprint, stage, outcome
        FROM session_items
        WHERE session_id = ?
        ORDER BY item_index
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let stage: String = row.get("stage");
            let outcome: Option<String> = row.get("outcome");
            Ok(ImageItem {
                index: row.get::<i64, _>("item_index") as usize,
                name: row.get("name"),
                fingerprint: row.get("fingerprint"),
                stage: ItemStage::parse(&stage)
                    .ok_or_else(|| Error::Internal(format!("Unknown item stage: {}", stage)))?,
                outcome: outcome
                    .as_deref()
                    .map(|o| from_json::<ItemOutcome>("item outcome", o))
                    .transpose()?,
            })
        })
        .collect()
}
