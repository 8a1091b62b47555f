//! Submitted query images, kept so sessions can be replayed

use coverid_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// One submitted query image
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SubmittedImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

pub async fn save_inputs(
    pool: &SqlitePool,
    session_id: Uuid,
    images: &[SubmittedImage],
) -> Result<()> {
    let session_id = session_id.to_string();

    retry_on_lock("save_inputs", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (index, image) in images.iter().enumerate() {
            sqlx::query(
                "INSERT OR REPLACE INTO session_inputs (session_id, item_index, name, image) VALUES (?, ?, ?, ?)",
            )
            .bind(&session_id)
            .bind(index as i64)
            .bind(&image.name)
            .bind(&image.bytes)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok::<_, coverid_common::Error>(())
    })
    .await
}

pub async fn load_inputs(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<SubmittedImage>> {
    let rows = sqlx::query(
        "SELECT name, image FROM session_inputs WHERE session_id = ? ORDER BY item_index",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SubmittedImage {
            name: row.get("name"),
            bytes: row.get("image"),
        })
        .collect())
}
