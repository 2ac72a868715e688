//! Pipelines
//!
//! Task registries declared on top of the workflow engine. Each pipeline
//! only assembles commands from the configuration; the engine decides
//! what runs.

pub mod variantcalling;

use crate::config::PipelineConfig;
use crate::error::DefinitionError;
use crate::workflow::TaskRegistry;

/// Name of the variant-calling pipeline, as used on the command line.
pub const VARIANTCALLING: &str = "variantcalling";

/// Builds the registry of a pipeline by name.
pub fn registry(name: &str, config: &PipelineConfig) -> Result<TaskRegistry, DefinitionError> {
    match name {
        VARIANTCALLING => variantcalling::registry(config),
        other => Err(DefinitionError::UnknownTask {
            task: "<pipeline>".to_string(),
            reference: other.to_string(),
        }),
    }
}
