//! Workflow Execution Module
//!
//! Runs the instance graph built by [`crate::workflow`].
//!
//! # Architecture
//!
//! - [`action`]: what a task instance runs
//! - [`executor`]: local child processes or cluster jobs
//! - [`queue`]: batch queue client used in cluster mode
//! - [`scheduler`]: the loop dispatching stale instances
//! - [`state`]: per-instance run state
//! - [`engine`]: snapshot, graph, executor and scheduler wired together

pub mod action;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod state;

pub use action::{Action, Binding, CommandAction, FnAction, NoopAction, Runnable, ShellAction};
pub use engine::{CancelHandle, Engine, ExecutionMode};
pub use executor::{ClusterSettings, Executor, Job, JobHandle, JobOutcome};
pub use queue::{JobId, QueueBackend, QueueStatus, SlurmQueue, SubmitRequest};
pub use scheduler::Scheduler;
pub use state::{FailureReason, InstanceState, SkipReason};
