//! Run Monitoring Module
//!
//! Tracks what happened during a run and summarises it.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Instance start/end timing for Gantt charts
//! - [`RunReport`]: Final state, attempts and diagnostics per instance

pub mod report;
pub mod timeline;

pub use report::{Counts, InstanceReport, RunReport};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
