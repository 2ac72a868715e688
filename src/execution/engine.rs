//! Pipeline Execution Engine
//!
//! Wires one run together:
//! 1. Takes a single snapshot of the working directory
//! 2. Builds the instance graph from the task registry
//! 3. Restricts it to the requested targets and their ancestors
//! 4. Runs the scheduler on a local or cluster executor
//!
//! The engine can be cancelled from another task (e.g. a Ctrl-C handler)
//! through a [`CancelHandle`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::watch;

use super::action::Runnable;
use super::executor::{ClusterSettings, Executor};
use super::queue::{QueueBackend, SlurmQueue};
use super::scheduler::Scheduler;
use crate::config::PipelineConfig;
use crate::error::{Result, SystemError};
use crate::monitoring::RunReport;
use crate::workflow::{Dag, DirectorySource, GraphBuilder, Snapshot, TaskRegistry};

/// Where commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Child processes on this machine
    Local,
    /// Jobs submitted to the batch queue
    Cluster,
}

/// Requests cancellation of a run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use ontvc::config::PipelineConfig;
/// use ontvc::execution::{Engine, ExecutionMode};
/// use ontvc::pipelines::variantcalling;
///
/// # async fn example() -> ontvc::Result<()> {
/// let config = PipelineConfig::discover()?.0;
/// let registry = variantcalling::registry(&config)?;
///
/// let mut engine = Engine::new(registry, config);
/// engine.set_mode(ExecutionMode::Local);
/// engine.set_targets(["full"]);
///
/// let report = engine.run().await?;
/// println!("{}", report.summary());
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    registry: TaskRegistry,
    config: PipelineConfig,
    working_dir: PathBuf,
    mode: ExecutionMode,
    dry_run: bool,
    max_parallel: Option<usize>,
    fail_fast: bool,
    targets: Vec<String>,
    backend: Option<Arc<dyn QueueBackend>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Engine {
    /// Creates an engine running locally in the configured working
    /// directory.
    pub fn new(registry: TaskRegistry, config: PipelineConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            working_dir: config.engine.working_dir.clone(),
            fail_fast: config.engine.fail_fast,
            registry,
            config,
            mode: ExecutionMode::Local,
            dry_run: false,
            max_parallel: None,
            targets: Vec::new(),
            backend: None,
            cancel: Arc::new(cancel),
        }
    }

    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = dir.into();
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Overrides the configured job limit (local jobs, or pending
    /// submissions in cluster mode).
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = Some(max.max(1));
    }

    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    /// Tasks to bring up to date. Empty means every task.
    pub fn set_targets<I, S>(&mut self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
    }

    /// Replaces the queue client built from the configuration.
    pub fn set_queue_backend(&mut self, backend: Arc<dyn QueueBackend>) {
        self.backend = Some(backend);
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: Arc::clone(&self.cancel),
        }
    }

    /// Snapshots the working directory and builds the graph of the
    /// selected targets.
    pub fn plan(&self) -> Result<(Snapshot, Dag)> {
        let source = DirectorySource::new(&self.working_dir);
        let snapshot = Snapshot::capture(&source)?;

        let dag = GraphBuilder::new(&self.registry, &snapshot).build()?;
        let dag = if self.targets.is_empty() {
            dag
        } else {
            let targets: Vec<&str> = self.targets.iter().map(String::as_str).collect();
            let selected = dag.select_targets(&targets)?;
            info!(
                "Targets {:?}: {} of {} instances selected",
                self.targets,
                selected.len(),
                dag.len()
            );
            selected
        };

        Ok((snapshot, dag))
    }

    fn executor(&self, working_dir: &Path) -> Executor {
        let engine = &self.config.engine;

        let executor = match self.mode {
            ExecutionMode::Local => Executor::local(
                working_dir,
                self.max_parallel.unwrap_or(engine.max_local_jobs),
            ),
            ExecutionMode::Cluster => {
                let cluster = &self.config.cluster;
                let backend = self.backend.clone().unwrap_or_else(|| {
                    Arc::new(SlurmQueue::new(
                        cluster.submit_command.as_str(),
                        cluster.poll_command.as_str(),
                        cluster.cancel_command.as_str(),
                    ))
                });

                Executor::cluster(
                    working_dir,
                    engine.max_local_jobs,
                    ClusterSettings {
                        backend,
                        poll_interval: engine.poll_interval(),
                        log_dir: cluster.log_dir.clone(),
                        default_queue: cluster.queue.clone(),
                        max_pending_submissions: self
                            .max_parallel
                            .unwrap_or(engine.max_pending_submissions),
                    },
                )
            }
        };

        executor.with_dry_run(self.dry_run)
    }

    /// Executes the selected targets.
    ///
    /// Definition and snapshot errors are returned before anything runs.
    /// Everything that happens afterwards, including failed jobs and a
    /// lost queue, is recorded in the report.
    pub async fn run(&self) -> Result<RunReport> {
        info!("Working directory: {}", self.working_dir.display());
        let (snapshot, dag) = self.plan()?;
        // Job scripts and queue requests need an absolute directory.
        let working_dir = fs::canonicalize(&self.working_dir).map_err(SystemError::Io)?;

        info!(
            "Starting execution ({} instances, mode: {:?}, dry run: {})",
            dag.len(),
            self.mode,
            self.dry_run
        );

        let executor = self.executor(&working_dir);
        let mut scheduler = Scheduler::new(&dag, &snapshot, executor, self.cancel.subscribe())
            .with_fail_fast(self.fail_fast);
        let report = scheduler.run().await;

        if self.dry_run {
            print_plan(&dag, &report);
        } else if !report.executed().is_empty() {
            debug!("{}", scheduler.timeline().gantt_chart());
        }

        Ok(report)
    }
}

/// Prints what a dry run would execute, in topological order.
fn print_plan(dag: &Dag, report: &RunReport) {
    for entry in report.executed() {
        let Some(instance) = dag.find(entry) else {
            continue;
        };

        println!();
        println!("[DRY RUN] Task: {}", instance.label);
        match instance.action.prepare(&instance.binding()) {
            Ok(Runnable::Command(command)) => println!("  Command: {}", command),
            Ok(Runnable::Callable(_)) => println!("  Command: <in-process>"),
            Ok(Runnable::Noop) => {}
            Err(reason) => println!("  Command: <error: {}>", reason),
        }
        println!("  Input: {:?}", instance.inputs);
        println!("  Output: {:?}", instance.outputs);
        println!("  Threads: {}", instance.hints.threads);
        if let Some(reason) = report.instance(entry).and_then(|r| r.stale_reason.as_ref()) {
            println!("  Reason: {}", reason);
        }
    }
    println!();
}
