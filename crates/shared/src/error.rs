//! Error taxonomy for the chat core

use thiserror::Error;

/// Core error type shared by the engine, API, and worker.
#[derive(Debug, Error)]
pub enum CoreError {
    // Authorization: surfaced immediately to the caller, never retried
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Origin not allowed for this site")]
    OriginNotAllowed,

    // Validation: rejected synchronously, no state mutated
    #[error("Validation error: {0}")]
    Validation(String),

    // Conflict / race
    #[error("Conversation already held by another agent")]
    ClaimFailed,
    #[error("Conversation is closed")]
    ConversationClosed,

    // Not found
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Message not found")]
    MessageNotFound,
    #[error("Attachment not found")]
    AttachmentNotFound,
    #[error("Agent not found")]
    AgentNotFound,

    // Infrastructure
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Presence backend error: {0}")]
    Presence(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code used in WS error frames and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthorized => "unauthorized",
            CoreError::Forbidden => "forbidden",
            CoreError::OriginNotAllowed => "origin_not_allowed",
            CoreError::Validation(_) => "validation_error",
            CoreError::ClaimFailed => "claim_failed",
            CoreError::ConversationClosed => "conversation_closed",
            CoreError::ConversationNotFound => "conversation_not_found",
            CoreError::MessageNotFound => "message_not_found",
            CoreError::AttachmentNotFound => "attachment_not_found",
            CoreError::AgentNotFound => "agent_not_found",
            CoreError::Storage(_) => "storage_error",
            CoreError::Presence(_) => "presence_error",
            CoreError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
