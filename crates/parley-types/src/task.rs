//! Task lifecycle states tracked by the task pool.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled task.
///
/// `Pending -> Running -> (Done | Failed | Cancelled)`, or
/// `Pending -> Cancelled` when cancellation lands before a worker picks the
/// task up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl TaskState {
    /// Whether the task has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}
