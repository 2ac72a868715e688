//! Workflow Definition Module
//!
//! Provides the data structures for declaring tasks and the logic that
//! turns them into a graph of concrete, file-bound task instances.
//!
//! # Structure
//!
//! - [`model`]: Task definitions, input sources and resource hints
//! - [`patterns`]: Input matching and output derivation
//! - [`registry`]: Ordered set of task definitions
//! - [`snapshot`]: Filesystem listing taken before a run
//! - [`graph`]: Instance expansion, dependency inference and target selection
//! - [`staleness`]: Up-to-date checks

pub mod graph;
pub mod model;
pub mod patterns;
pub mod registry;
pub mod snapshot;
pub mod staleness;

pub use graph::{Dag, GraphBuilder, InstanceId, TaskInstance};
pub use model::{Aggregation, InputSource, ResourceHints, TaskBuilder, TaskDefinition};
pub use patterns::{Captures, InputPattern, OutputRule};
pub use registry::TaskRegistry;
pub use snapshot::{DirectorySource, MemorySource, Snapshot, SnapshotSource};
pub use staleness::{StaleReason, Staleness, StalenessChecker};
