use axum::{debug_handler, extract::{Path, State}, http::StatusCode, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    appresult::SyncError,
    auth::{self, ConnectionContext},
    db::{self, Membership},
    protocol::ServerEvent,
    AppResult, AppState,
};

/// Relays a typing change to the other connections in the room. Nothing is
/// stored.
pub fn set_typing(
    state: &AppState,
    ctx: &ConnectionContext,
    room_id: Uuid,
    is_typing: bool,
) -> Result<usize, SyncError> {
    if !state.registry.is_joined(ctx.conn_id, room_id) {
        return Err(SyncError::Membership(room_id));
    }
    Ok(state.registry.fanout_room(
        room_id,
        &ServerEvent::TypingChanged { is_typing, room_id, username: ctx.username.clone() },
        Some(ctx.conn_id),
    ))
}

/// Tells every room the connection is joined to that its user stopped
/// typing. Run before the connection leaves the registry.
pub fn clear_typing(state: &AppState, ctx: &ConnectionContext) -> usize {
    state
        .registry
        .joined_rooms(ctx.conn_id)
        .into_iter()
        .map(|room_id| {
            state.registry.fanout_room(
                room_id,
                &ServerEvent::TypingChanged { is_typing: false, room_id, username: ctx.username.clone() },
                Some(ctx.conn_id),
            )
        })
        .sum()
}

/// Moves the caller's read cursor to `key`. Returns false, without writing,
/// when the cursor already points there.
pub async fn mark_read(
    db_pool: &SqlitePool,
    username: &str,
    room_id: Uuid,
    key: &str,
) -> Result<bool, SyncError> {
    let membership = db::require_membership(db_pool, username, room_id).await?;
    if membership.last_read_message_id.as_deref() == Some(key) {
        return Ok(false);
    }

    if db::fetch_message(db_pool, key)
        .await?
        .filter(|message| message.room_id == room_id)
        .is_none()
    {
        return Err(SyncError::NotFound(format!("message {key}")));
    }

    sqlx::query("UPDATE memberships SET last_read_key=? WHERE username=? AND room_id=?")
        .bind(key)
        .bind(username)
        .bind(room_id.to_string())
        .execute(db_pool)
        .await?;
    Ok(true)
}

/// Flags a member may set on their own membership. Absent fields are kept.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnFlags {
    pub hidden: Option<bool>,
    pub notification_muted: Option<bool>,
    pub pinned: Option<bool>,
    pub favourited: Option<bool>,
}

pub async fn update_flags(
    db_pool: &SqlitePool,
    username: &str,
    room_id: Uuid,
    flags: &OwnFlags,
) -> Result<Membership, SyncError> {
    db::require_membership(db_pool, username, room_id).await?;
    sqlx::query(
        "UPDATE memberships SET
             hidden=COALESCE(?,hidden),
             notification_muted=COALESCE(?,notification_muted),
             pinned=COALESCE(?,pinned),
             favourited=COALESCE(?,favourited)
         WHERE username=? AND room_id=?",
    )
    .bind(flags.hidden)
    .bind(flags.notification_muted)
    .bind(flags.pinned)
    .bind(flags.favourited)
    .bind(username)
    .bind(room_id.to_string())
    .execute(db_pool)
    .await?;
    db::require_membership(db_pool, username, room_id).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadCursorBody {
    message_key: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn read_cursor(
    Path(room_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(ReadCursorBody { message_key }): Json<ReadCursorBody>,
) -> AppResult<StatusCode> {
    let username = auth::session_user(&session, &db_pool).await?;
    if mark_read(&db_pool, &username, room_id, &message_key).await? {
        tracing::debug!(%username, %room_id, key = %message_key, "read cursor moved");
    }
    Ok(StatusCode::OK)
}

#[debug_handler(state = AppState)]
pub(crate) async fn flags(
    Path(room_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(flags): Json<OwnFlags>,
) -> AppResult<Json<Membership>> {
    let username = auth::session_user(&session, &db_pool).await?;
    Ok(Json(update_flags(&db_pool, &username, room_id, &flags).await?))
}
