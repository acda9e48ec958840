//! Backward pagination over a room's message log.
//!
//! Pages are keyed by a message key rather than an offset, so messages that
//! arrive at the bottom never shift an already-issued cursor.

use std::sync::Arc;

use axum::{debug_handler, extract::{Path, Query, State}, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    appresult::SyncError,
    auth,
    config::Config,
    db::{self, Message, MessageRow, MESSAGE_COLUMNS},
    AppResult,
};

/// Up to `limit` messages strictly older than `cursor` (or the newest ones
/// without a cursor), oldest first. Hidden messages keep their slot. An empty
/// page means history is exhausted.
pub async fn page(
    db_pool: &SqlitePool,
    room_id: Uuid,
    cursor: Option<&str>,
    limit: u32,
) -> Result<Vec<Message>, SyncError> {
    let rows: Vec<MessageRow> = match cursor {
        None => {
            sqlx::query_as(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=?
                 ORDER BY created_at DESC, key DESC LIMIT ?"
            ))
            .bind(room_id.to_string())
            .bind(limit)
            .fetch_all(db_pool)
            .await?
        }
        Some(cursor) => {
            let Some(anchor) = db::fetch_message(db_pool, cursor)
                .await?
                .filter(|message| message.room_id == room_id)
            else {
                return Err(SyncError::NotFound(format!("cursor {cursor}")));
            };

            sqlx::query_as(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=?
                 AND (created_at < ? OR (created_at = ? AND key < ?))
                 ORDER BY created_at DESC, key DESC LIMIT ?"
            ))
            .bind(room_id.to_string())
            .bind(anchor.created_at)
            .bind(anchor.created_at)
            .bind(&anchor.key)
            .bind(limit)
            .fetch_all(db_pool)
            .await?
        }
    };

    let mut messages = rows
        .into_iter()
        .map(Message::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}

/// Every message ever stored in the room, hidden ones included.
pub async fn count(db_pool: &SqlitePool, room_id: Uuid) -> Result<u64, SyncError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id=?")
        .bind(room_id.to_string())
        .fetch_one(db_pool)
        .await?;
    Ok(count as u64)
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageQuery {
    cursor: Option<String>,
    limit: Option<u32>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn messages(
    Path(room_id): Path<Uuid>,
    Query(PageQuery { cursor, limit }): Query<PageQuery>,
    State(db_pool): State<SqlitePool>,
    State(config): State<Arc<Config>>,
    session: Session,
) -> AppResult<Json<Vec<Message>>> {
    let username = auth::session_user(&session, &db_pool).await?;
    db::require_membership(&db_pool, &username, room_id).await?;

    let cursor = cursor.as_deref().filter(|cursor| !cursor.is_empty());
    Ok(Json(page(&db_pool, room_id, cursor, config.page_limit(limit)).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn message_count(
    Path(room_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<Json<u64>> {
    let username = auth::session_user(&session, &db_pool).await?;
    db::require_membership(&db_pool, &username, room_id).await?;
    Ok(Json(count(&db_pool, room_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::ContentType,
        rooms::{new, testing::*},
        AppState,
    };

    async fn insert(state: &AppState, room_id: Uuid, key: &str, created_at: i64) {
        sqlx::query(
            "INSERT INTO messages (key,room_id,sender,content,content_type,created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(key)
        .bind(room_id.to_string())
        .bind("ada")
        .bind(format!("body {key}"))
        .bind(ContentType::Text.as_str())
        .bind(created_at)
        .execute(&state.db_pool)
        .await
        .unwrap();
    }

    async fn room_with(count: usize) -> (AppState, Uuid) {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let room_id = new::create_private_room(&state, &ada, "bob").await.unwrap();
        for i in 0..count {
            insert(&state, room_id, &format!("m{i:02}"), 1_000 + i as i64).await;
        }
        (state, room_id)
    }

    fn keys(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.key.as_str()).collect()
    }

    #[tokio::test]
    async fn newest_page_is_oldest_first() {
        let (state, room_id) = room_with(5).await;

        let newest = page(&state.db_pool, room_id, None, 3).await.unwrap();
        assert_eq!(keys(&newest), ["m02", "m03", "m04"]);
    }

    #[tokio::test]
    async fn consecutive_pages_have_no_gap_or_overlap() {
        let (state, room_id) = room_with(25).await;

        let newer = page(&state.db_pool, room_id, None, 10).await.unwrap();
        let older = page(&state.db_pool, room_id, Some(newer[0].key.as_str()), 10).await.unwrap();

        let joined: Vec<&str> = keys(&older).into_iter().chain(keys(&newer)).collect();
        let expected: Vec<String> = (5..25).map(|i| format!("m{i:02}")).collect();
        assert_eq!(joined, expected);
    }

    #[tokio::test]
    async fn walking_back_is_strictly_increasing_and_terminates() {
        let (state, room_id) = room_with(23).await;
        // two messages sharing a timestamp are ordered by key
        insert(&state, room_id, "a-tie", 1_010).await;

        let mut walked: Vec<Message> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut chunk = page(&state.db_pool, room_id, cursor.as_deref(), 7).await.unwrap();
            let Some(oldest) = chunk.first() else {
                break;
            };
            cursor = Some(oldest.key.clone());
            chunk.append(&mut walked);
            walked = chunk;
        }

        assert_eq!(walked.len(), 24);
        assert!(walked.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
        assert_eq!(count(&state.db_pool, room_id).await.unwrap(), 24);
    }

    #[tokio::test]
    async fn late_arrivals_do_not_shift_cursor() {
        let (state, room_id) = room_with(10).await;
        let first = page(&state.db_pool, room_id, None, 4).await.unwrap();

        insert(&state, room_id, "m99", 9_999).await;

        let older = page(&state.db_pool, room_id, Some(first[0].key.as_str()), 4).await.unwrap();
        assert_eq!(keys(&older), ["m02", "m03", "m04", "m05"]);
    }

    #[tokio::test]
    async fn hidden_messages_keep_their_slot() {
        let (state, room_id) = room_with(3).await;
        sqlx::query("UPDATE messages SET hidden=1 WHERE key='m01'")
            .execute(&state.db_pool)
            .await
            .unwrap();

        let all = page(&state.db_pool, room_id, None, 10).await.unwrap();
        assert_eq!(keys(&all), ["m00", "m01", "m02"]);
        assert!(all[1].hidden);
    }

    #[tokio::test]
    async fn cursor_from_another_room_is_not_found() {
        let (state, room_id) = room_with(2).await;
        let (ada, _rx) = connect(&state, "ada");
        let group = new::create_group(&state, &ada, &["bob".into()], "crew").await.unwrap();

        let err = page(&state.db_pool, group, Some("m00"), 5).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(page(&state.db_pool, room_id, Some("m00"), 5).await.unwrap().is_empty());
    }
}
