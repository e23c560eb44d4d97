use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, globally unique name of one submitted code run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        ExecutionId(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ExecutionId)
    }
}

/// Rough size of the simulation user code intends to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub const ALL: [Complexity; 3] = [Complexity::Low, Complexity::Medium, Complexity::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// Hints attached to an accelerated (physics) execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicsRequirements {
    #[serde(default)]
    pub needs_gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hint_mb: Option<u64>,
    #[serde(default)]
    pub complexity: Complexity,
}

/// Execution Input (Immutable)
/// Written once by the submitting side, read by exactly one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub cell_id: String,
    pub notebook_id: String,
    pub execution_count: u32,
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub enable_physics: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics_requirements: Option<PhysicsRequirements>,
    /// Caller identity, carried along but never interpreted here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Execution State Machine
///
/// `queued → running → {completed | error | cancelled | timeout}`, plus
/// `queued → cancelled` for work cancelled before any worker claimed it.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
    Timeout,
}

impl ExecutionState {
    pub fn all_variants() -> &'static [ExecutionState] {
        &[
            ExecutionState::Queued,
            ExecutionState::Running,
            ExecutionState::Completed,
            ExecutionState::Error,
            ExecutionState::Cancelled,
            ExecutionState::Timeout,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Queued | ExecutionState::Running)
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match self {
            ExecutionState::Queued => {
                matches!(next, ExecutionState::Running | ExecutionState::Cancelled)
            }
            ExecutionState::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Error => "error",
            ExecutionState::Cancelled => "cancelled",
            ExecutionState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionState::all_variants()
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown execution state: {}", s))
    }
}

/// Lifecycle record of one execution
/// Mutated only by the worker that owns the execution; read by anyone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    pub cell_id: String,
    pub notebook_id: String,
    pub execution_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Length of the output log at read time
    #[serde(default)]
    pub output_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionStatus {
    pub fn queued(id: ExecutionId, request: &ExecutionRequest, at: DateTime<Utc>) -> Self {
        Self {
            execution_id: id,
            state: ExecutionState::Queued,
            cell_id: request.cell_id.clone(),
            notebook_id: request.notebook_id.clone(),
            execution_count: request.execution_count,
            created_at: at,
            started_at: None,
            completed_at: None,
            output_count: 0,
            detail: None,
        }
    }

    /// Apply a transition locally, stamping the matching timestamp
    pub fn apply(&mut self, next: ExecutionState, at: DateTime<Utc>, detail: Option<&str>) {
        self.state = next;
        if next == ExecutionState::Running {
            self.started_at = Some(at);
        } else if next.is_terminal() {
            self.completed_at = Some(at);
        }
        if let Some(detail) = detail {
            self.detail = Some(detail.to_string());
        }
    }
}

/// Kind tag of an output record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    DisplayData,
    Error,
}

/// One observable event of an execution
///
/// This is also the line format the in-sandbox harness prints, one JSON
/// object per line, e.g. `{"output_type":"stdout","text":"hi\n","timestamp":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum ExecutionOutput {
    Stdout {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Stderr {
        text: String,
        timestamp: DateTime<Utc>,
    },
    DisplayData {
        /// media type → base64 payload
        data: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        ExecutionOutput::Stdout {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        ExecutionOutput::Stderr {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        ExecutionOutput::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            ExecutionOutput::Stdout { .. } => OutputKind::Stdout,
            ExecutionOutput::Stderr { .. } => OutputKind::Stderr,
            ExecutionOutput::DisplayData { .. } => OutputKind::DisplayData,
            ExecutionOutput::Error { .. } => OutputKind::Error,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExecutionOutput::Stdout { timestamp, .. }
            | ExecutionOutput::Stderr { timestamp, .. }
            | ExecutionOutput::DisplayData { timestamp, .. }
            | ExecutionOutput::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind() == OutputKind::Error
    }
}

/// Snapshot of queue pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub running: u64,
    pub max_concurrent: u64,
    pub available_slots: u64,
}

impl QueueStatus {
    pub fn new(pending: u64, running: u64, max_concurrent: u64) -> Self {
        Self {
            pending,
            running,
            max_concurrent,
            available_slots: max_concurrent.saturating_sub(running),
        }
    }
}

/// Published once per execution when it reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    pub execution_time_ms: u64,
}
