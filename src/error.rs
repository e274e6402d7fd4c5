use thiserror::Error;

/// Failure taxonomy for the relay. Validation errors are returned
/// synchronously to the calling operation and never retried by the relay;
/// transport-level failures surface as the `connection_lost` push event.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("display name must not be empty")]
    InvalidName,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("{0} not found")]
    NotFound(String),
    #[error("reader is not the recipient of this message")]
    Forbidden,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("superseded by a newer connection")]
    Superseded,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl ChatError {
    /// HTTP status for the synchronous API surface.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ChatError::InvalidName | ChatError::EmptyContent => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::Transport(_) | ChatError::Superseded => StatusCode::CONFLICT,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
