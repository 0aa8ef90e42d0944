use crate::model::Span;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("This time slot is no longer available (conflicts with {0})")]
    Conflict(Span),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("busy source failed: {0}")]
    Upstream(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        EngineError::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
