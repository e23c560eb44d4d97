pub mod types;
pub mod redis;
pub mod config;
pub mod error;
pub mod store;
pub mod orchestrator;

// Re-export commonly used types for convenience
pub use types::{
    ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState, ExecutionStatus, QueueStatus,
};
pub use config::Config;
pub use error::{StoreError, SubmitError};
pub use orchestrator::{CancelOutcome, Orchestrator, SubmissionLimits, MAX_CODE_BYTES};
pub use store::{MemoryStore, RedisStore, StateStore};
