//! Engine error type

use persistence::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input rows or invalid strategy/config parameters
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read or atomically commit store files
    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("Simulation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
