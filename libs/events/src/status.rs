//! Task status updates reported by the resource manager.

use chrono::{DateTime, Utc};
use keel_id::TaskId;
use serde::{Deserialize, Serialize};

/// State of a launched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
    Dropped,
    Gone,
    Unreachable,
    Unknown,
}

impl TaskState {
    /// Returns true if the task will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
                | TaskState::Dropped
                | TaskState::Gone
        )
    }

    /// Returns true if the task ended without completing its work.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && *self != TaskState::Finished
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Staging => "staging",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::Lost => "lost",
            TaskState::Error => "error",
            TaskState::Dropped => "dropped",
            TaskState::Gone => "gone",
            TaskState::Unreachable => "unreachable",
            TaskState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staging" => Some(TaskState::Staging),
            "starting" => Some(TaskState::Starting),
            "running" => Some(TaskState::Running),
            "finished" => Some(TaskState::Finished),
            "failed" => Some(TaskState::Failed),
            "killed" => Some(TaskState::Killed),
            "lost" => Some(TaskState::Lost),
            "error" => Some(TaskState::Error),
            "dropped" => Some(TaskState::Dropped),
            "gone" => Some(TaskState::Gone),
            "unreachable" => Some(TaskState::Unreachable),
            "unknown" => Some(TaskState::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An out-of-band status update for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,

    /// Readiness check result, when the task declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl TaskStatusUpdate {
    /// A status update stamped with the current time.
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            ready: None,
            message: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach a readiness result.
    #[must_use]
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Attach a human readable reason.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
