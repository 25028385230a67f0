use serde::{Deserialize, Serialize};
use std::fmt;

/// Job state definitions for batch lifecycle management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Initial state when job is created
    Pending,
    /// Job is currently being executed by the worker pool
    Running,
    /// Job was paused (manually or by credential exhaustion)
    Paused,
    /// Job finished with no pending work remaining
    Completed,
    /// Job aborted due to a scheduler-level failure
    Failed,
    /// Job found with a stale heartbeat after a crash
    Interrupted,
    /// Job was cancelled by the operator
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this is an active state (workers may be processing items)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the job can be picked up again by a resume operation
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Interrupted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

/// Work item state definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Initial state when item is created, also the state an item returns to
    /// when its claim is released without a terminal outcome
    Pending,
    /// Item is claimed by a worker
    Running,
    /// All sub-units completed successfully
    Completed,
    /// At least one sub-unit failed permanently or exhausted its retries
    Failed,
    /// Item was abandoned by a cancelled job before it was claimed
    Skipped,
}

impl ItemState {
    /// Check if this is a terminal state (counts toward job completion)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Check if this is an active state (item is claimed by a worker)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid item state: {s}")),
        }
    }
}

/// Default state for new jobs
impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Default state for new work items
impl Default for ItemState {
    fn default() -> Self {
        Self::Pending
    }
}
