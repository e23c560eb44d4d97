use crate::types::{ExecutionId, ExecutionState};
use thiserror::Error;

/// Errors raised by the execution state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing Redis instance failed or is unreachable.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored record is missing fields or holds unparseable values.
    #[error("corrupt record for execution {id}: {reason}")]
    Corrupt { id: ExecutionId, reason: String },

    /// Caller asked for a move the state machine forbids.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },
}

impl StoreError {
    pub fn corrupt(id: ExecutionId, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            id,
            reason: reason.into(),
        }
    }
}

/// Errors raised while accepting a new execution.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Request rejected before queuing.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Request was valid but could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::Invalid(_) => "invalid",
            SubmitError::Store(_) => "store_unavailable",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
