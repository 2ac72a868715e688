//! ontvc - Nanopore Variant Calling Pipeline
//!
//! A file-driven task orchestration engine and the nanopore
//! variant-calling pipeline declared on top of it. Tasks declare which
//! files they consume and produce; the engine infers the dependency graph,
//! skips everything that is up to date and runs the rest locally or on a
//! cluster queue.
//!
//! # Architecture
//!
//! - [`workflow`]: Task definitions, filesystem snapshot, graph building
//!   and staleness
//! - [`execution`]: Actions, executor, queue client, scheduler and engine
//! - [`monitoring`]: Execution timeline and run report
//! - [`pipelines`]: The declared variant-calling workflow
//! - [`config`]: `pipeline.yml` handling
//!
//! # Example
//!
//! ```rust,no_run
//! use ontvc::config::PipelineConfig;
//! use ontvc::execution::Engine;
//! use ontvc::pipelines::variantcalling;
//!
//! #[tokio::main]
//! async fn main() -> ontvc::Result<()> {
//!     let (config, _) = PipelineConfig::discover()?;
//!     let registry = variantcalling::registry(&config)?;
//!
//!     let mut engine = Engine::new(registry, config);
//!     engine.set_max_parallel(4);
//!     engine.set_targets(["full"]);
//!
//!     let report = engine.run().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipelines;
pub mod workflow;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use execution::engine::Engine;
pub use monitoring::RunReport;
pub use workflow::{TaskDefinition, TaskRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ontvc";
