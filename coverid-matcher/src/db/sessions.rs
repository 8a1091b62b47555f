//! Match session persistence

use coverid_common::events::{SessionState, StartedBy};
use coverid_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, from_json, parse_timestamp, to_json};
use crate::models::Session;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const SESSION_COLUMNS: &str = r#"
    session_id, state, started_by, replay_of, replayed_by, evaluation_group,
    total_items, processed_items, successful_items, failed_items,
    percentage_complete, current_stage, status_message, error_message,
    preset_name, preset, target, best_similarity, evaluation,
    time_started, last_updated, time_finished, revision
"#;

/// Insert or update a session row (items are stored separately)
///
/// A row is only overwritten by a session with an equal or higher revision,
/// so concurrent workers persisting out of order never move counters back.
pub async fn save_session(pool: &SqlitePool, session: &Session) -> Result<()> {
    // Prepare all data before acquiring a connection
    let session_id = session.session_id.to_string();
    let preset = to_json("preset", &session.preset)?;
    let target = to_json("target", &session.target)?;
    let evaluation = session
        .evaluation
        .as_ref()
        .map(|e| to_json("evaluation", e))
        .transpose()?;
    let replay_of = session.replay_of.map(|id| id.to_string());
    let replayed_by = session.replayed_by.map(|id| id.to_string());
    let time_started = format_timestamp(session.time_started);
    let last_updated = format_timestamp(session.last_updated);
    let time_finished = session.time_finished.map(format_timestamp);

    retry_on_lock("save_session", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO match_sessions (
                session_id, state, started_by, replay_of, replayed_by, evaluation_group,
                total_items, processed_items, successful_items, failed_items,
                percentage_complete, current_stage, status_message, error_message,
                preset_name, preset, target, best_similarity, evaluation,
                time_started, last_updated, time_finished, revision
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                state = excluded.state,
                replayed_by = excluded.replayed_by,
                processed_items = excluded.processed_items,
                successful_items = excluded.successful_items,
                failed_items = excluded.failed_items,
                percentage_complete = excluded.percentage_complete,
                current_stage = excluded.current_stage,
                status_message = excluded.status_message,
                error_message = excluded.error_message,
                best_similarity = excluded.best_similarity,
                evaluation = excluded.evaluation,
                last_updated = excluded.last_updated,
                time_finished = excluded.time_finished,
                revision = excluded.revision
            WHERE excluded.revision >= match_sessions.revision
            "#,
        )
        .bind(&session_id)
        .bind(session.state.as_str())
        .bind(session.started_by.as_str())
        .bind(&replay_of)
        .bind(&replayed_by)
        .bind(&session.evaluation_group)
        .bind(session.total_items as i64)
        .bind(session.processed_items as i64)
        .bind(session.successful_items as i64)
        .bind(session.failed_items as i64)
        .bind(i64::from(session.percentage_complete))
        .bind(&session.current_stage)
        .bind(&session.status_message)
        .bind(&session.error_message)
        .bind(&session.preset_name)
        .bind(&preset)
        .bind(&target)
        .bind(session.best_similarity)
        .bind(&evaluation)
        .bind(&time_started)
        .bind(&last_updated)
        .bind(&time_finished)
        .bind(session.revision)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<_, Error>(())
    })
    .await
}

/// Load a session row (without items)
pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<Session>> {
    let query = format!(
        "SELECT {} FROM match_sessions WHERE session_id = ?",
        SESSION_COLUMNS
    );
    let row = sqlx::query(&query)
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// Most recently started sessions first (without items)
pub async fn list_sessions(pool: &SqlitePool, limit: usize) -> Result<Vec<Session>> {
    let query = format!(
        "SELECT {} FROM match_sessions ORDER BY time_started DESC LIMIT ?",
        SESSION_COLUMNS
    );
    let rows = sqlx::query(&query)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(session_from_row).collect()
}

/// Sessions left QUEUED or PROCESSING (e.g. by a previous process)
pub async fn list_unfinished_sessions(pool: &SqlitePool) -> Result<Vec<Session>> {
    let query = format!(
        "SELECT {} FROM match_sessions WHERE state IN ('QUEUED', 'PROCESSING') ORDER BY time_started",
        SESSION_COLUMNS
    );
    let rows = sqlx::query(&query).fetch_all(pool).await?;
    rows.iter().map(session_from_row).collect()
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    let session_id: String = row.get("session_id");
    let state: String = row.get("state");
    let started_by: String = row.get("started_by");
    let replay_of: Option<String> = row.get("replay_of");
    let replayed_by: Option<String> = row.get("replayed_by");
    let preset: String = row.get("preset");
    let target: String = row.get("target");
    let evaluation: Option<String> = row.get("evaluation");
    let time_started: String = row.get("time_started");
    let last_updated: String = row.get("last_updated");
    let time_finished: Option<String> = row.get("time_finished");

    Ok(Session {
        session_id: parse_uuid("session_id", &session_id)?,
        state: SessionState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown session state: {}", state)))?,
        started_by: StartedBy::parse(&started_by)
            .ok_or_else(|| Error::Internal(format!("Unknown started_by: {}", started_by)))?,
        total_items: row.get::<i64, _>("total_items") as usize,
        processed_items: row.get::<i64, _>("processed_items") as usize,
        successful_items: row.get::<i64, _>("successful_items") as usize,
        failed_items: row.get::<i64, _>("failed_items") as usize,
        percentage_complete: row.get::<i64, _>("percentage_complete").clamp(0, 100) as u8,
        current_stage: row.get("current_stage"),
        status_message: row.get("status_message"),
        error_message: row.get("error_message"),
        evaluation_group: row.get("evaluation_group"),
        replay_of: replay_of
            .as_deref()
            .map(|s| parse_uuid("replay_of", s))
            .transpose()?,
        replayed_by: replayed_by
            .as_deref()
            .map(|s| parse_uuid("replayed_by", s))
            .transpose()?,
        preset_name: row.get("preset_name"),
        preset: from_json("preset", &preset)?,
        target: from_json("target", &target)?,
        best_similarity: row.get("best_similarity"),
        evaluation: evaluation
            .as_deref()
            .map(|e| from_json("evaluation", e))
            .transpose()?,
        items: Vec::new(),
        time_started: parse_timestamp("time_started", &time_started)?,
        last_updated: parse_timestamp("last_updated", &last_updated)?,
        time_finished: time_finished
            .as_deref()
            .map(|t| parse_timestamp("time_finished", t))
            .transpose()?,
        revision: row.get("revision"),
    })
}
