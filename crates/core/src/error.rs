use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("session token expired at {expired_at_ms}ms")]
    TokenExpired { expired_at_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
