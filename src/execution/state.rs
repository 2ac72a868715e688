//! Run State
//!
//! Per-instance state owned by the scheduler for the duration of one run.
//! Nothing here is persisted between runs; staleness is always recomputed
//! from the filesystem.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Why an instance failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonZeroExit(i32),
    TimeoutExceeded,
    SubmissionError,
    ActionError,
    /// Label of the failed predecessor
    BlockedByUpstreamFailure(String),
    Cancelled,
}

impl From<&ExecutionError> for FailureReason {
    fn from(error: &ExecutionError) -> Self {
        match error {
            ExecutionError::NonZeroExit { code, .. } => Self::NonZeroExit(*code),
            ExecutionError::TimeoutExceeded { .. } => Self::TimeoutExceeded,
            ExecutionError::SubmissionError { .. } => Self::SubmissionError,
            ExecutionError::Spawn { .. } | ExecutionError::Action { .. } => Self::ActionError,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "exit status {}", code),
            Self::TimeoutExceeded => write!(f, "wall time exceeded"),
            Self::SubmissionError => write!(f, "submission rejected"),
            Self::ActionError => write!(f, "action error"),
            Self::BlockedByUpstreamFailure(label) => write!(f, "blocked by {}", label),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why an instance did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpToDate,
    Cancelled,
}

/// State of one instance within a run.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed(FailureReason),
    Skipped(SkipReason),
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }

    /// True for states that let dependents proceed.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped(SkipReason::UpToDate))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            Self::Skipped(SkipReason::UpToDate) => write!(f, "up to date"),
            Self::Skipped(SkipReason::Cancelled) => write!(f, "skipped (cancelled)"),
        }
    }
}
