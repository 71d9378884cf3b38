use thiserror::Error;

/// Core error type for drover operations.
#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The caller presented a session ID that is no longer current.
    /// Only a fresh registration recovers from this.
    #[error("Session invalid")]
    SessionInvalid,

    #[error("Node should disconnect immediately")]
    NodeMustDisconnect,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// Whether the referenced entity was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the caller must re-register before retrying.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid)
    }
}

/// Result type alias using DroverError.
pub type Result<T> = std::result::Result<T, DroverError>;
