use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::{
    appresult::SyncError,
    auth::ConnectionContext,
    db::{self, Message, MESSAGE_COLUMNS},
    protocol::{NewMessage, ServerEvent},
    AppState,
};

/// Fans a new message out to the rest of the room, then persists it in the
/// background. The returned task resolves once the write settled and the
/// sender got `messageDelivered` or `messageFailed`. A failed write never
/// retracts the fan-out.
pub fn send_msg(
    state: &AppState,
    ctx: &ConnectionContext,
    NewMessage { key, room_id, content, content_type, .. }: NewMessage,
) -> Result<JoinHandle<Result<(), SyncError>>, SyncError> {
    if key.trim().is_empty() {
        return Err(SyncError::Invalid("message key must not be empty".to_owned()));
    }
    if !state.registry.is_joined(ctx.conn_id, room_id) {
        return Err(SyncError::Membership(room_id));
    }

    let message = Message {
        key,
        room_id,
        sender: ctx.username.clone(),
        content,
        content_type,
        // the client clock only places the optimistic copy
        created_at: db::now_millis(),
        edited_at: None,
        hidden: false,
    };

    let reached = state.registry.fanout_room(
        room_id,
        &ServerEvent::Message { message: message.clone() },
        Some(ctx.conn_id),
    );
    tracing::debug!(key = %message.key, %room_id, reached, "message fanned out");

    let db_pool = state.db_pool.clone();
    let registry = state.registry.clone();
    let limit = state.config.persist_timeout;
    let conn_id = ctx.conn_id;

    Ok(tokio::spawn(async move {
        let stored = db::timed(limit, persist(&db_pool, &message)).await;
        let Message { key, room_id, .. } = message;

        match stored {
            Ok(created_at) => {
                registry.send_to(conn_id, ServerEvent::MessageDelivered { key, room_id, created_at });
                Ok(())
            }
            Err(err) => {
                tracing::error!(%key, %room_id, error = %err, "message not persisted");
                registry.send_to(conn_id, ServerEvent::MessageFailed { key, room_id });
                Err(err)
            }
        }
    }))
}

/// Inserts the message unless its key is already stored. Returns the stored
/// creation time, which for a replayed key is the first one.
async fn persist(db_pool: &SqlitePool, message: &Message) -> Result<i64, SyncError> {
    sqlx::query(
        "INSERT INTO messages (key,room_id,sender,content,content_type,created_at) VALUES (?,?,?,?,?,?)
         ON CONFLICT(key) DO NOTHING",
    )
    .bind(&message.key)
    .bind(message.room_id.to_string())
    .bind(&message.sender)
    .bind(&message.content)
    .bind(message.content_type.as_str())
    .bind(message.created_at)
    .execute(db_pool)
    .await
    .map_err(|err| SyncError::PersistFailed(err.to_string()))?;

    let (room_id, created_at): (String, i64) =
        sqlx::query_as("SELECT room_id,created_at FROM messages WHERE key=?")
            .bind(&message.key)
            .fetch_one(db_pool)
            .await
            .map_err(|err| SyncError::PersistFailed(err.to_string()))?;

    if room_id != message.room_id.to_string() {
        return Err(SyncError::PersistFailed(format!("key {} is used in another room", message.key)));
    }
    Ok(created_at)
}

async fn find_in_room(db_pool: &SqlitePool, key: &str, room_id: uuid::Uuid) -> Result<Message, SyncError> {
    sqlx::query_as::<_, db::MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE key=? AND room_id=?"
    ))
    .bind(key)
    .bind(room_id.to_string())
    .fetch_optional(db_pool)
    .await?
    .map(Message::try_from)
    .transpose()?
    .ok_or_else(|| SyncError::NotFound(format!("message {key}")))
}

/// Replaces the content of one of the caller's own messages. Position in the
/// room order is untouched.
pub async fn edit_msg(
    state: &AppState,
    ctx: &ConnectionContext,
    key: &str,
    content: String,
    room_id: uuid::Uuid,
) -> Result<i64, SyncError> {
    let db_pool = &state.db_pool;
    db::require_membership(db_pool, &ctx.username, room_id).await?;

    let message = find_in_room(db_pool, key, room_id).await?;
    if message.sender != ctx.username {
        return Err(SyncError::Forbidden("only the sender may edit a message"));
    }

    let edited_at = db::now_millis().max(message.created_at);
    db::timed(state.config.persist_timeout, async {
        sqlx::query("UPDATE messages SET content=?,edited_at=? WHERE key=?")
            .bind(&content)
            .bind(edited_at)
            .bind(key)
            .execute(db_pool)
            .await?;
        Ok::<_, SyncError>(())
    })
    .await?;

    state.registry.fanout_room(
        room_id,
        &ServerEvent::MessageEdited { key: key.to_owned(), content, room_id, edited_at },
        None,
    );
    tracing::debug!(%key, %room_id, "message edited");
    Ok(edited_at)
}

/// Hides a message. The row stays, so paginated history keeps its slot.
pub async fn delete_msg(
    state: &AppState,
    ctx: &ConnectionContext,
    key: &str,
    room_id: uuid::Uuid,
) -> Result<(), SyncError> {
    let db_pool = &state.db_pool;
    let membership = db::require_membership(db_pool, &ctx.username, room_id).await?;

    let message = find_in_room(db_pool, key, room_id).await?;
    if message.sender != ctx.username && !membership.admin {
        return Err(SyncError::Forbidden("only the sender or a room admin may delete a message"));
    }

    db::timed(state.config.persist_timeout, async {
        sqlx::query("UPDATE messages SET hidden=1 WHERE key=?")
            .bind(key)
            .execute(db_pool)
            .await?;
        Ok::<_, SyncError>(())
    })
    .await?;

    state.registry.fanout_room(
        room_id,
        &ServerEvent::MessageDeleted { key: key.to_owned(), room_id },
        None,
    );
    tracing::debug!(%key, %room_id, by = %ctx.username, "message hidden");
    Ok(())
}
