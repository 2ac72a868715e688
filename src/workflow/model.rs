//! Workflow Data Model
//!
//! Core data structures describing the declared workflow: task definitions,
//! their input sources, output rules and resource hints.
//!
//! # Example
//!
//! ```
//! use ontvc::execution::action::ShellAction;
//! use ontvc::workflow::{Aggregation, OutputRule, TaskDefinition};
//!
//! let mapping = TaskDefinition::builder("run_mapping")
//!     .input_regex(r"data\.dir/(\S+)\.fastq\.gz")
//!     .output(OutputRule::template(r"mapped.dir/\1_sorted.bam"))
//!     .action(ShellAction::new("minimap2 -ax map-ont ref.fa {input} | samtools sort -o {output}"))
//!     .threads(4)
//!     .build()
//!     .unwrap();
//!
//! let merge = TaskDefinition::builder("merge")
//!     .from_tasks(&["run_mapping"], None)
//!     .aggregation(Aggregation::ManyToOne)
//!     .output(OutputRule::fixed("mapped.dir/all.txt"))
//!     .action(ShellAction::new("ls {inputs} > {output}"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(mapping.name(), "run_mapping");
//! assert_eq!(merge.aggregation(), Aggregation::ManyToOne);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::patterns::{InputPattern, OutputRule};
use crate::error::DefinitionError;
use crate::execution::action::{Action, NoopAction};

/// How matched inputs are grouped into task instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    /// One instance per matched input
    OneToOne,
    /// A single instance over every matched input (merge / fan-in)
    ManyToOne,
    /// One instance per derived output, all sharing the same input
    OneToMany,
}

impl Default for Aggregation {
    fn default() -> Self {
        Self::OneToOne
    }
}

/// Resource requests attached to a task.
///
/// Locally these are advice only; in cluster mode they are forwarded to
/// the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Number of threads/cores the action uses
    pub threads: usize,
    /// Queue class (e.g. "all.q", "gpu")
    pub queue: Option<String>,
    /// Wall-time budget; exceeding it fails the instance
    pub wall_time: Option<Duration>,
    /// Memory request, passed through verbatim (e.g. "16G")
    pub memory: Option<String>,
    /// Extra options handed to the queue submission untouched
    pub job_options: Option<String>,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            threads: 1,
            queue: None,
            wall_time: None,
            memory: None,
            job_options: None,
        }
    }
}

/// Where a task looks for its inputs.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Files in the snapshot, plus outputs of instances resolved earlier
    Files(InputPattern),
    /// Outputs of the named upstream tasks, optionally filtered by a pattern
    Tasks {
        upstream: Vec<String>,
        pattern: Option<InputPattern>,
    },
    /// No inputs (targets and other ordering-only tasks)
    None,
}

impl InputSource {
    /// The pattern used to filter candidates, if any.
    pub fn pattern(&self) -> Option<&InputPattern> {
        match self {
            Self::Files(p) => Some(p),
            Self::Tasks { pattern, .. } => pattern.as_ref(),
            Self::None => None,
        }
    }
}

/// Immutable description of one workflow step.
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    input: InputSource,
    output: OutputRule,
    aggregation: Aggregation,
    after: Vec<String>,
    action: Arc<dyn Action>,
    hints: ResourceHints,
    retries: u32,
}

impl TaskDefinition {
    /// Starts building a definition.
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &InputSource {
        &self.input
    }

    pub fn output(&self) -> &OutputRule {
        &self.output
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Tasks that must finish before any instance of this one.
    pub fn after(&self) -> &[String] {
        &self.after
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }

    pub fn hints(&self) -> &ResourceHints {
        &self.hints
    }

    /// How many times a failed execution is retried.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Names of every task this one depends on by declaration.
    pub fn upstream_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = match &self.input {
            InputSource::Tasks { upstream, .. } => upstream.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        };
        names.extend(self.after.iter().map(String::as_str));
        names
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("aggregation", &self.aggregation)
            .field("after", &self.after)
            .field("action", &self.action)
            .field("hints", &self.hints)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Builder returning an immutable [`TaskDefinition`].
///
/// Pattern compilation errors are kept until [`TaskBuilder::build`] so that
/// calls can be chained.
pub struct TaskBuilder {
    name: String,
    input: InputSource,
    output: OutputRule,
    aggregation: Aggregation,
    after: Vec<String>,
    action: Option<Arc<dyn Action>>,
    hints: ResourceHints,
    retries: u32,
    error: Option<DefinitionError>,
}

impl TaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: InputSource::None,
            output: OutputRule::Nothing,
            aggregation: Aggregation::OneToOne,
            after: Vec::new(),
            action: None,
            hints: ResourceHints::default(),
            retries: 0,
            error: None,
        }
    }

    fn compile(&mut self, pattern: &str, regex: bool) -> Option<InputPattern> {
        let compiled = if regex {
            InputPattern::regex(pattern)
        } else {
            InputPattern::glob(pattern)
        };

        match compiled {
            Ok(p) => Some(p),
            Err(reason) => {
                self.error.get_or_insert(DefinitionError::InvalidPattern {
                    task: self.name.clone(),
                    pattern: pattern.to_string(),
                    reason,
                });
                None
            }
        }
    }

    /// Inputs are files matching a regular expression.
    pub fn input_regex(mut self, pattern: &str) -> Self {
        if let Some(p) = self.compile(pattern, true) {
            self.input = InputSource::Files(p);
        }
        self
    }

    /// Inputs are files matching a glob.
    pub fn input_glob(mut self, pattern: &str) -> Self {
        if let Some(p) = self.compile(pattern, false) {
            self.input = InputSource::Files(p);
        }
        self
    }

    /// Inputs are the outputs of upstream tasks, optionally filtered by a
    /// regular expression.
    pub fn from_tasks(mut self, upstream: &[&str], regex: Option<&str>) -> Self {
        let pattern = regex.and_then(|r| self.compile(r, true));
        self.input = InputSource::Tasks {
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
            pattern,
        };
        self
    }

    pub fn output(mut self, rule: OutputRule) -> Self {
        self.output = rule;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Adds an ordering dependency on another task.
    pub fn after(mut self, task: impl Into<String>) -> Self {
        self.after.push(task.into());
        self
    }

    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn shared_action(mut self, action: Arc<dyn Action>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.hints.threads = threads.max(1);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.hints.queue = Some(queue.into());
        self
    }

    pub fn wall_time(mut self, wall_time: Duration) -> Self {
        self.hints.wall_time = Some(wall_time);
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.hints.memory = Some(memory.into());
        self
    }

    pub fn job_options(mut self, options: impl Into<String>) -> Self {
        self.hints.job_options = Some(options.into());
        self
    }

    pub fn hints(mut self, hints: ResourceHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Finalizes the definition.
    ///
    /// Fails if a pattern did not compile or an output template references
    /// a placeholder the input pattern can never provide.
    pub fn build(self) -> Result<TaskDefinition, DefinitionError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        if let Some(pattern) = self.input.pattern() {
            let available = pattern.available_placeholders();
            if let Some(missing) = self
                .output
                .placeholders()
                .into_iter()
                .find(|p| !available.contains(p))
            {
                return Err(DefinitionError::UnresolvedPlaceholder {
                    task: self.name,
                    placeholder: missing,
                });
            }
        }

        Ok(TaskDefinition {
            name: self.name,
            input: self.input,
            output: self.output,
            aggregation: self.aggregation,
            after: self.after,
            action: self.action.unwrap_or_else(|| Arc::new(NoopAction)),
            hints: self.hints,
            retries: self.retries,
        })
    }
}
