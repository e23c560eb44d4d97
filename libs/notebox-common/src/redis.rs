use crate::types::ExecutionId;

/// Redis key layout - defines only naming, not runtime logic
/// Keeps API, worker and CLI agreeing on where every record lives

pub const PENDING_QUEUE: &str = "notebox:queue:pending";
pub const RUNNING_SET: &str = "notebox:running";
pub const CAPACITY_KEY: &str = "notebox:pool:capacity";
pub const COMPLETIONS_CHANNEL: &str = "notebox:events:completions";

pub const STATUS_PREFIX: &str = "notebox:status";
pub const OUTPUT_PREFIX: &str = "notebox:outputs";
pub const REQUEST_PREFIX: &str = "notebox:request";
pub const CANCEL_PREFIX: &str = "notebox:cancel";

/// Status hash of an execution
pub fn status_key(id: &ExecutionId) -> String {
    format!("{}:{}", STATUS_PREFIX, id)
}

/// Ordered output list of an execution
pub fn output_key(id: &ExecutionId) -> String {
    format!("{}:{}", OUTPUT_PREFIX, id)
}

/// Serialized immutable request
pub fn request_key(id: &ExecutionId) -> String {
    format!("{}:{}", REQUEST_PREFIX, id)
}

/// Cancellation flag observed by the owning worker
pub fn cancel_key(id: &ExecutionId) -> String {
    format!("{}:{}", CANCEL_PREFIX, id)
}
