use axum::{routing::post, Router};
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{appresult::SyncError, db, rooms::registry::ConnectionId, session::USER_ID, AppResult, AppState};

mod login;
mod logout;

pub use login::login;
pub use logout::logout;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session", post(login).delete(logout))
}

/// Identity bound to one live connection. The username never changes for the
/// lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub conn_id: ConnectionId,
    pub username: String,
}

/// Resolves a claimed username against the user store.
pub async fn authenticate(db_pool: &SqlitePool, claimed: &str) -> Result<db::User, SyncError> {
    let claimed = claimed.trim();
    if claimed.is_empty() {
        return Err(SyncError::Auth("<empty>".to_owned()));
    }

    db::fetch_user(db_pool, claimed)
        .await?
        .ok_or_else(|| SyncError::Auth(claimed.to_owned()))
}

/// The username bound to this session, re-checked against the user store.
pub async fn session_user(session: &Session, db_pool: &SqlitePool) -> AppResult<String> {
    let Some(username) = session.get::<String>(USER_ID).await? else {
        return Err(SyncError::Auth("<no session>".to_owned()).into());
    };
    Ok(authenticate(db_pool, &username).await?.username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;

    #[tokio::test]
    async fn known_users_authenticate() {
        let pool = test_pool().await;
        seed_users(&pool, &["ada"]).await;

        let user = authenticate(&pool, "ada").await.unwrap();
        assert_eq!(user.username, "ada");
    }

    #[tokio::test]
    async fn unknown_or_empty_claims_fail() {
        let pool = test_pool().await;
        seed_users(&pool, &["ada"]).await;

        assert!(matches!(authenticate(&pool, "mallory").await, Err(SyncError::Auth(_))));
        assert!(matches!(authenticate(&pool, "  ").await, Err(SyncError::Auth(_))));
    }
}
