use serde::{Deserialize, Serialize};

/// Events that can trigger job state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// Start processing a pending job
    Start,
    /// Pause a running job (manual or automatic on credential exhaustion)
    Pause(String),
    /// Resume a paused or interrupted job
    Resume,
    /// Mark job as completed (all items terminal)
    Complete,
    /// Mark job as failed with error message
    Fail(String),
    /// Cancel the job
    Cancel,
    /// Mark a stale running job as interrupted during a recovery scan
    MarkInterrupted,
}

impl JobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause(_) => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::MarkInterrupted => "mark_interrupted",
        }
    }

    /// Extract the attached message, if the event carries one
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Pause(msg) | Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_) | Self::Cancel)
    }
}
