pub mod history;
pub mod msg;
pub mod new;
pub mod presence;
pub mod registry;
mod ws;

use axum::{debug_handler, extract::{Path, State}, routing::{get, put}, Json, Router};
use sqlx::SqlitePool;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    appresult::SyncError,
    auth::{self, ConnectionContext},
    db::{self, RoomDetails},
    protocol::ServerEvent,
    AppResult, AppState,
};

pub use ws::{dispatch, gateway};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(rooms))
        .route("/{room_id}/participants", get(participants))
        .route("/{room_id}/messages", get(history::messages))
        .route("/{room_id}/messageCount", get(history::message_count))
        .route("/{room_id}/readCursor", put(presence::read_cursor))
        .route("/{room_id}/flags", put(presence::flags))
}

/// Adds the connection to the room's broadcast group. Only persisted members
/// may join; joining twice is a no-op.
pub(crate) async fn join(state: &AppState, ctx: &ConnectionContext, room_id: Uuid) -> Result<(), SyncError> {
    db::require_membership(&state.db_pool, &ctx.username, room_id).await?;
    if state.registry.join(ctx.conn_id, room_id) {
        tracing::debug!(conn = ctx.conn_id, %room_id, "joined room group");
    }
    Ok(())
}

/// Joins a fresh connection to every room its user belongs to and sends it
/// the room list.
pub async fn sync_connection(state: &AppState, ctx: &ConnectionContext) -> Result<(), SyncError> {
    let rooms = db::user_rooms(&state.db_pool, &ctx.username).await?;
    for details in &rooms {
        state.registry.join(ctx.conn_id, details.room.room_id);
    }
    state.registry.send_to(ctx.conn_id, ServerEvent::RoomsUpdated { rooms });
    Ok(())
}

/// Sends `username` a fresh room list on every live connection.
pub(crate) async fn push_rooms(state: &AppState, username: &str) -> Result<(), SyncError> {
    let rooms = db::user_rooms(&state.db_pool, username).await?;
    state.registry.fanout_users(&[username], &ServerEvent::RoomsUpdated { rooms });
    Ok(())
}

#[debug_handler(state = AppState)]
pub(crate) async fn rooms(
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<Json<Vec<RoomDetails>>> {
    let username = auth::session_user(&session, &db_pool).await?;
    Ok(Json(db::user_rooms(&db_pool, &username).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn participants(
    Path(room_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<Json<Vec<String>>> {
    let username = auth::session_user(&session, &db_pool).await?;
    db::require_membership(&db_pool, &username, room_id).await?;
    Ok(Json(db::participants(&db_pool, room_id).await?))
}
