use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the synchronization core.
///
/// Protocol errors (`Auth`, `Membership`, `Forbidden`, `Invalid`) end the
/// operation that raised them and are reported to the initiating client only.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown user {0}")]
    Auth(String),
    #[error("not a member of room {0}")]
    Membership(Uuid),
    #[error("a private room already exists for this pair")]
    DuplicateRoom { room_id: Uuid },
    #[error("{0} not found")]
    NotFound(String),
    #[error("persisting failed: {0}")]
    PersistFailed(String),
    #[error("not allowed: {0}")]
    Forbidden(&'static str),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl SyncError {
    /// Wire name used in `error` events.
    pub fn kind(&self) -> &'static str {
        use SyncError::*;
        match self {
            Auth(_) => "auth",
            Membership(_) => "membership",
            DuplicateRoom { .. } => "duplicateRoom",
            NotFound(_) => "notFound",
            PersistFailed(_) => "persistFailed",
            Forbidden(_) => "forbidden",
            Invalid(_) => "invalid",
            Db(_) => "internal",
        }
    }

    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            SyncError::DuplicateRoom { room_id } | SyncError::Membership(room_id) => Some(*room_id),
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        use SyncError::*;
        match self {
            Auth(_) => StatusCode::UNAUTHORIZED,
            Membership(_) | Forbidden(_) => StatusCode::FORBIDDEN,
            DuplicateRoom { .. } => StatusCode::CONFLICT,
            NotFound(_) => StatusCode::NOT_FOUND,
            PersistFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Invalid(_) => StatusCode::BAD_REQUEST,
            Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<SyncError>() {
            if !matches!(err, SyncError::Db(_)) {
                let body = json!({
                    "kind": err.kind(),
                    "message": err.to_string(),
                    "roomId": err.room_id(),
                });
                return (err.status(), Json(body)).into_response();
            }
        }

        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
