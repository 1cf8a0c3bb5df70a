//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chatwire_shared::CoreError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Origin not allowed for this site")]
    OriginNotAllowed,

    // Validation
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resources
    #[error("Resource not found")]
    NotFound,
    #[error("Conversation already taken")]
    ClaimConflict,
    #[error("Conversation is closed")]
    ConversationClosed,

    // Internal
    #[error("Database error: {0}")]
    Database(String),
    #[error("Presence backend error: {0}")]
    Presence(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),
            ApiError::OriginNotAllowed => {
                (StatusCode::FORBIDDEN, "ORIGIN_NOT_ALLOWED", self.to_string())
            }

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::ClaimConflict => (StatusCode::CONFLICT, "CLAIM_CONFLICT", self.to_string()),
            ApiError::ConversationClosed => {
                (StatusCode::CONFLICT, "CONVERSATION_CLOSED", self.to_string())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Presence(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PRESENCE_UNAVAILABLE",
                "Presence backend unavailable".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unauthorized => ApiError::Unauthorized,
            CoreError::Forbidden => ApiError::Forbidden,
            CoreError::OriginNotAllowed => ApiError::OriginNotAllowed,
            CoreError::Validation(msg) => ApiError::Validation(msg),
            CoreError::ClaimFailed => ApiError::ClaimConflict,
            CoreError::ConversationClosed => ApiError::ConversationClosed,
            CoreError::ConversationNotFound
            | CoreError::MessageNotFound
            | CoreError::AttachmentNotFound
            | CoreError::AgentNotFound => ApiError::NotFound,
            CoreError::Storage(msg) => {
                tracing::error!(error = %msg, "Storage error");
                ApiError::Database(msg)
            }
            CoreError::Presence(msg) => {
                tracing::error!(error = %msg, "Presence error");
                ApiError::Presence(msg)
            }
            CoreError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = ?err, "Database error");
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            other => ApiError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        assert!(matches!(
            ApiError::from(CoreError::ClaimFailed),
            ApiError::ClaimConflict
        ));
        assert!(matches!(
            ApiError::from(CoreError::ConversationNotFound),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(CoreError::Validation("bad".into())),
            ApiError::Validation(_)
        ));
    }
}
