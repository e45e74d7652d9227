use marksync_core::CoreError;
use marksync_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the engine and its presentation handle.
///
/// Lower-layer failures are flattened into strings so results can be cloned
/// into the published view state and across reply channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no active session")]
    NoSession,

    #[error("session ended before the result was applied")]
    SessionEnded,

    #[error("sync controller has shut down")]
    Closed,

    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Only an authorization failure tears the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unauthorized(msg) => Self::Auth(msg),
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Core(core) => core.into(),
            other => Self::Network(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::InvalidSignature | CoreError::TokenExpired { .. } => {
                Self::Auth(err.to_string())
            }
            other => Self::Network(other.to_string()),
        }
    }
}
