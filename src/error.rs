//! Error Types
//!
//! Errors are split by when they can occur and how far they reach:
//!
//! - [`DefinitionError`]: raised while building the task graph, before any
//!   job is dispatched. Never retried.
//! - [`ExecutionError`]: a single task instance failed. Only that instance
//!   and its dependents are affected.
//! - [`SystemError`]: the engine lost a collaborator it cannot schedule
//!   without (queue, filesystem). Aborts the run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems with the declared workflow.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Task '{0}' is already registered")]
    DuplicateTaskName(String),

    #[error("Task '{task}' references unknown task '{reference}'")]
    UnknownTask { task: String, reference: String },

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Output '{}' is claimed by both '{first}' and '{second}'", .path.display())]
    AmbiguousOutput {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("Task '{task}': invalid input pattern '{pattern}': {reason}")]
    InvalidPattern {
        task: String,
        pattern: String,
        reason: String,
    },

    #[error("Task '{task}': output template uses unknown placeholder '{{{placeholder}}}'")]
    UnresolvedPlaceholder { task: String, placeholder: String },
}

/// Failure of one task instance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("'{label}' exited with status {code}")]
    NonZeroExit { label: String, code: i32 },

    #[error("'{label}' exceeded its wall-time budget of {budget:?}")]
    TimeoutExceeded { label: String, budget: Duration },

    #[error("'{label}' could not be submitted: {reason}")]
    SubmissionError { label: String, reason: String },

    #[error("'{label}' could not be started: {reason}")]
    Spawn { label: String, reason: String },

    #[error("'{label}' action failed: {reason}")]
    Action { label: String, reason: String },
}

/// Failure of a collaborator the whole run depends on.
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Queue interface unreachable: {0}")]
    QueueUnreachable(String),

    #[error("Filesystem snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems loading or writing `pipeline.yml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("No pipeline.yml found (searched: {})", .searched.join(", "))]
    NotFound { searched: Vec<String> },

    #[error("Failed to write config: {0}")]
    Write(String),
}

/// Crate-wide error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
