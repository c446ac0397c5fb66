use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failures reported by a backend of record.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A uniqueness constraint rejected the write; somebody else got there first.
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("backend rejected request: {0:?}")]
    Rejected(ApiError),
    #[error("backend transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
            || matches!(self, BackendError::Rejected(err) if err.code == ErrorCode::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
            || matches!(self, BackendError::Rejected(err) if err.code == ErrorCode::NotFound)
    }
}

impl From<ApiError> for BackendError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Conflict => BackendError::Conflict(value.message),
            ErrorCode::NotFound => BackendError::NotFound(value.message),
            _ => BackendError::Rejected(value),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("sign in to use direct messages")]
    NotSignedIn,
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error("user {user_id} is not part of conversation {conversation_id}")]
    NotParticipant { conversation_id: i64, user_id: i64 },
    #[error("message must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Backend(#[from] BackendError),
}
