use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{db::User, session::USER_ID, AppResult};

use super::authenticate;

#[derive(Deserialize)]
pub(crate) struct LoginBody {
    pub(crate) username: String,
}

/// Binds an existing user to the session. Credential checks happen upstream.
#[debug_handler(state = crate::AppState)]
pub async fn login(
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(LoginBody { username }): Json<LoginBody>,
) -> AppResult<Json<User>> {
    let user = authenticate(&db_pool, &username).await?;

    session.cycle_id().await?;
    session.insert(USER_ID, &user.username).await?;

    tracing::info!(username = %user.username, "session bound");
    Ok(Json(user))
}
