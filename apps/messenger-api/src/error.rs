use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::gateway::call::CallError;

/// Structured HTTP error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// HTTP-level error, used before a socket is upgraded.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Failure reported by a repository implementation.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(String),
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<diesel::result::Error> for RepoError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound,
            other => {
                tracing::error!(?other, "database error");
                Self::Database(other.to_string())
            }
        }
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for RepoError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        tracing::error!(?err, "pool error");
        Self::Pool(err.to_string())
    }
}

/// Everything a hub can reject or fail with.
///
/// The `Display` text becomes the `message` of the `error` event sent back to
/// the originating connection.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("server at capacity")]
    AtCapacity,
    #[error("server shutting down")]
    ShuttingDown,
    #[error("{0}")]
    Validation(String),
    #[error("not a member of this chat")]
    NotMember,
    #[error("only the author can modify this message")]
    NotAuthor,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("user offline")]
    UserOffline,
    #[error("user busy")]
    UserBusy,
    #[error("already in a call")]
    AlreadyInCall,
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("request timed out")]
    Timeout,
    #[error("internal error")]
    Repository(#[from] RepoError),
}

impl HubError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Collaborator failures are logged in full but surfaced generically.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Timeout | Self::Repository(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_error_messages_are_client_facing() {
        assert_eq!(HubError::NotMember.to_string(), "not a member of this chat");
        assert_eq!(HubError::NotFound("message").to_string(), "message not found");
        assert_eq!(
            HubError::validation("chat_id is required").to_string(),
            "chat_id is required"
        );
        assert_eq!(
            HubError::Repository(RepoError::Database("boom".into())).to_string(),
            "internal error"
        );
    }

    #[test]
    fn internal_classification() {
        assert!(HubError::Timeout.is_internal());
        assert!(HubError::Repository(RepoError::NotFound).is_internal());
        assert!(!HubError::UserOffline.is_internal());
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: RepoError = diesel::result::Error::NotFound.into();
        assert!(matches!(err, RepoError::NotFound));
    }
}
