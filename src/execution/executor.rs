//! Job Executor
//!
//! Runs prepared jobs either as local child processes or as jobs submitted
//! to a cluster queue. Each submitted job runs on its own tokio task and is
//! driven through a [`JobHandle`]:
//! - `wait` resolves once the job reached a terminal outcome and its
//!   process (or queue job) has been released
//! - `cancel` kills the process, or cancels the queue job
//!
//! Concurrency is bounded here as well as in the scheduler: local jobs hold
//! a `max_local_jobs` permit while running, cluster jobs hold a
//! `max_pending_submissions` permit from submission until the queue reports
//! a terminal state.
//!
//! Declared outputs that a failed or cancelled attempt created or modified
//! are deleted before the outcome is reported, so that a later run never
//! mistakes a partial file for an up-to-date one.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Semaphore};

use super::action::{Binding, Callable, Runnable};
use super::queue::{JobId, QueueBackend, QueueError, QueueStatus, SubmitRequest};
use crate::error::{ExecutionError, SystemError};

/// Number of trailing stderr (or log) lines kept for the report.
pub const DIAGNOSTIC_LINES: usize = 50;

/// A bound instance together with what to run for it.
#[derive(Debug, Clone)]
pub struct Job {
    pub binding: Binding,
    pub runnable: Runnable,
}

/// Terminal result of one job.
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded,
    Failed {
        error: ExecutionError,
        /// Last lines of stderr or of the queue log
        diagnostics: Vec<String>,
    },
    /// The job was cancelled through its handle
    Cancelled,
    /// A collaborator the whole run depends on is gone
    Fatal(SystemError),
}

impl JobOutcome {
    fn failed(error: ExecutionError) -> Self {
        Self::Failed {
            error,
            diagnostics: Vec::new(),
        }
    }
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    label: String,
    cancel: Option<oneshot::Sender<()>>,
    outcome: Option<oneshot::Receiver<JobOutcome>>,
}

impl JobHandle {
    /// Waits for the job to finish. Subsequent calls report the job as
    /// cancelled.
    pub async fn wait(&mut self) -> JobOutcome {
        match self.outcome.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                JobOutcome::failed(ExecutionError::Action {
                    label: self.label.clone(),
                    reason: "job runner terminated unexpectedly".to_string(),
                })
            }),
            None => JobOutcome::Cancelled,
        }
    }

    /// Requests cancellation. Has no effect once the job finished.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Detaches the cancellation sender, so that the handle itself can be
    /// moved into a task awaiting the outcome.
    pub fn take_canceller(&mut self) -> Option<oneshot::Sender<()>> {
        self.cancel.take()
    }
}

/// Settings for cluster submission.
#[derive(Clone)]
pub struct ClusterSettings {
    pub backend: Arc<dyn QueueBackend>,
    pub poll_interval: Duration,
    /// Directory receiving job scripts and queue logs
    pub log_dir: PathBuf,
    /// Queue used when a task gives no queue hint
    pub default_queue: Option<String>,
    pub max_pending_submissions: usize,
}

impl std::fmt::Debug for ClusterSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSettings")
            .field("poll_interval", &self.poll_interval)
            .field("log_dir", &self.log_dir)
            .field("default_queue", &self.default_queue)
            .field("max_pending_submissions", &self.max_pending_submissions)
            .finish()
    }
}

#[derive(Debug)]
enum Mode {
    Local,
    Cluster {
        settings: ClusterSettings,
        submissions: Arc<Semaphore>,
    },
}

#[derive(Debug)]
struct ExecutorInner {
    working_dir: PathBuf,
    dry_run: bool,
    local_slots: Arc<Semaphore>,
    max_local_jobs: usize,
    mode: Mode,
}

/// Runs jobs locally or on a cluster queue.
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Executor running every job as a local child process.
    pub fn local(working_dir: impl Into<PathBuf>, max_local_jobs: usize) -> Self {
        let max_local_jobs = max_local_jobs.max(1);
        Self {
            inner: Arc::new(ExecutorInner {
                working_dir: working_dir.into(),
                dry_run: false,
                local_slots: Arc::new(Semaphore::new(max_local_jobs)),
                max_local_jobs,
                mode: Mode::Local,
            }),
        }
    }

    /// Executor submitting commands to a queue. Callables still run
    /// in-process, bounded by `max_local_jobs`.
    pub fn cluster(working_dir: impl Into<PathBuf>, max_local_jobs: usize, settings: ClusterSettings) -> Self {
        let max_local_jobs = max_local_jobs.max(1);
        let pending = settings.max_pending_submissions.max(1);
        Self {
            inner: Arc::new(ExecutorInner {
                working_dir: working_dir.into(),
                dry_run: false,
                local_slots: Arc::new(Semaphore::new(max_local_jobs)),
                max_local_jobs,
                mode: Mode::Cluster {
                    settings: ClusterSettings {
                        max_pending_submissions: pending,
                        ..settings
                    },
                    submissions: Arc::new(Semaphore::new(pending)),
                },
            }),
        }
    }

    /// Returns a copy of this executor that spawns nothing and reports
    /// every job as successful.
    pub fn with_dry_run(self, dry_run: bool) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => ExecutorInner {
                working_dir: shared.working_dir.clone(),
                dry_run: shared.dry_run,
                local_slots: Arc::new(Semaphore::new(shared.max_local_jobs)),
                max_local_jobs: shared.max_local_jobs,
                mode: match &shared.mode {
                    Mode::Local => Mode::Local,
                    Mode::Cluster { settings, .. } => Mode::Cluster {
                        settings: settings.clone(),
                        submissions: Arc::new(Semaphore::new(settings.max_pending_submissions)),
                    },
                },
            },
        };
        Self {
            inner: Arc::new(ExecutorInner { dry_run, ..inner }),
        }
    }

    /// Maximum number of jobs the scheduler should keep in flight.
    pub fn capacity(&self) -> usize {
        match &self.inner.mode {
            Mode::Local => self.inner.max_local_jobs,
            Mode::Cluster { settings, .. } => settings.max_pending_submissions,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.inner.dry_run
    }

    /// Starts a job. Must be called from within a tokio runtime.
    pub fn submit(&self, job: Job) -> JobHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let label = job.binding.label.clone();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let outcome = inner.run(job, cancel_rx).await;
            let _ = outcome_tx.send(outcome);
        });

        JobHandle {
            label,
            cancel: Some(cancel_tx),
            outcome: Some(outcome_rx),
        }
    }

    pub async fn wait(&self, handle: &mut JobHandle) -> JobOutcome {
        handle.wait().await
    }

    pub fn cancel(&self, handle: &mut JobHandle) {
        handle.cancel();
    }
}

/// Resolves when cancellation is requested; never resolves if the sender is
/// dropped without sending.
async fn cancelled(rx: oneshot::Receiver<()>) {
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves once the wall-time budget is spent, or never without one.
async fn deadline(wall_time: Option<Duration>) {
    match wall_time {
        Some(budget) => tokio::time::sleep(budget).await,
        None => std::future::pending::<()>().await,
    }
}

fn timeout_error(binding: &Binding) -> ExecutionError {
    ExecutionError::TimeoutExceeded {
        label: binding.label.clone(),
        budget: binding.hints.wall_time.unwrap_or_default(),
    }
}

impl ExecutorInner {
    async fn run(&self, job: Job, cancel_rx: oneshot::Receiver<()>) -> JobOutcome {
        let label = job.binding.label.clone();

        if self.dry_run {
            debug!("[dry run] {}", label);
            return JobOutcome::Succeeded;
        }

        if matches!(job.runnable, Runnable::Noop) {
            return JobOutcome::Succeeded;
        }

        let previous = output_times(&job.binding.outputs, &self.working_dir);

        if let Err(e) = ensure_output_directories(&job.binding.outputs, &self.working_dir) {
            return JobOutcome::failed(ExecutionError::Spawn {
                label,
                reason: format!("creating output directories: {}", e),
            });
        }

        let outcome = match (&self.mode, job.runnable) {
            (_, Runnable::Noop) => JobOutcome::Succeeded,
            (_, Runnable::Callable(f)) => self.run_callable(&job.binding, f, cancel_rx).await,
            (Mode::Local, Runnable::Command(cmd)) => self.run_command(&job.binding, &cmd, cancel_rx).await,
            (Mode::Cluster { settings, submissions }, Runnable::Command(cmd)) => {
                self.run_on_queue(&job.binding, &cmd, settings, submissions, cancel_rx)
                    .await
            }
        };

        match &outcome {
            JobOutcome::Succeeded => debug!("Job '{}' completed successfully", label),
            JobOutcome::Failed { error, .. } => error!("{}", error),
            JobOutcome::Cancelled => info!("Job '{}' cancelled", label),
            JobOutcome::Fatal(e) => error!("Job '{}': {}", label, e),
        }

        if matches!(outcome, JobOutcome::Failed { .. } | JobOutcome::Cancelled) {
            remove_partial_outputs(&label, &previous);
        }
        outcome
    }

    async fn run_callable(
        &self,
        binding: &Binding,
        f: Callable,
        cancel_rx: oneshot::Receiver<()>,
    ) -> JobOutcome {
        let Ok(permit) = Arc::clone(&self.local_slots).acquire_owned().await else {
            return JobOutcome::Cancelled;
        };

        let label = binding.label.clone();
        // The slot stays taken until the closure returns.
        let mut task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        let interrupted = tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(Ok(())) => JobOutcome::Succeeded,
                    Ok(Err(reason)) => JobOutcome::Failed {
                        error: ExecutionError::Action { label, reason: reason.clone() },
                        diagnostics: vec![reason],
                    },
                    Err(e) => JobOutcome::failed(ExecutionError::Action {
                        label,
                        reason: format!("callable panicked: {}", e),
                    }),
                };
            }
            _ = cancelled(cancel_rx) => JobOutcome::Cancelled,
            _ = deadline(binding.hints.wall_time) => JobOutcome::failed(timeout_error(binding)),
        };

        // Blocking closures cannot be interrupted.
        debug!("{}: waiting for callable to return", label);
        let _ = task.await;
        interrupted
    }

    async fn run_command(
        &self,
        binding: &Binding,
        command: &str,
        cancel_rx: oneshot::Receiver<()>,
    ) -> JobOutcome {
        let Ok(_permit) = Arc::clone(&self.local_slots).acquire_owned().await else {
            return JobOutcome::Cancelled;
        };

        debug!("{}: {}", binding.label, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in resource_environment(binding) {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return JobOutcome::failed(ExecutionError::Spawn {
                    label: binding.label.clone(),
                    reason: e.to_string(),
                })
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let label = binding.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", label, line);
                }
            });
        }

        let stderr_tail = child.stderr.take().map(|stderr| {
            let label = binding.label.clone();
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(DIAGNOSTIC_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", label, line);
                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail)
            })
        });

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => JobOutcome::Succeeded,
                Ok(status) => JobOutcome::failed(ExecutionError::NonZeroExit {
                    label: binding.label.clone(),
                    code: status.code().unwrap_or(-1),
                }),
                Err(e) => JobOutcome::failed(ExecutionError::Spawn {
                    label: binding.label.clone(),
                    reason: format!("waiting for process: {}", e),
                }),
            },
            _ = cancelled(cancel_rx) => JobOutcome::Cancelled,
            _ = deadline(binding.hints.wall_time) => JobOutcome::failed(timeout_error(binding)),
        };

        if !matches!(outcome, JobOutcome::Succeeded) {
            if let Err(e) = child.kill().await {
                debug!("{}: kill after exit: {}", binding.label, e);
            }
        }

        match outcome {
            JobOutcome::Failed { error, .. } => {
                // Background grandchildren may keep the pipe open.
                let diagnostics = match stderr_tail {
                    Some(handle) => match tokio::time::timeout(Duration::from_secs(1), handle).await {
                        Ok(Ok(lines)) => lines,
                        _ => Vec::new(),
                    },
                    None => Vec::new(),
                };
                JobOutcome::Failed { error, diagnostics }
            }
            other => other,
        }
    }

    async fn run_on_queue(
        &self,
        binding: &Binding,
        command: &str,
        settings: &ClusterSettings,
        submissions: &Arc<Semaphore>,
        cancel_rx: oneshot::Receiver<()>,
    ) -> JobOutcome {
        // Held until the queue reports the job as terminal.
        let Ok(_permit) = Arc::clone(submissions).acquire_owned().await else {
            return JobOutcome::Cancelled;
        };

        let name = job_name(&binding.label);
        let log_dir = self.working_dir.join(&settings.log_dir);
        let script = match write_job_script(&log_dir, &name, command, &self.working_dir, binding) {
            Ok(path) => path,
            Err(e) => {
                return JobOutcome::failed(ExecutionError::SubmissionError {
                    label: binding.label.clone(),
                    reason: format!("writing job script: {}", e),
                })
            }
        };

        let log_path = log_dir.join(format!("{}.log", name));
        let request = SubmitRequest {
            name,
            script,
            working_dir: self.working_dir.clone(),
            log_path: log_path.clone(),
            threads: binding.hints.threads,
            queue: binding.hints.queue.clone().or_else(|| settings.default_queue.clone()),
            memory: binding.hints.memory.clone(),
            wall_time: binding.hints.wall_time,
            job_options: binding.hints.job_options.clone(),
        };

        let backend = &settings.backend;
        let id = match backend.submit(&request).await {
            Ok(id) => id,
            Err(QueueError::Rejected(reason)) => {
                return JobOutcome::failed(ExecutionError::SubmissionError {
                    label: binding.label.clone(),
                    reason,
                })
            }
            Err(QueueError::Unreachable(reason)) => {
                return JobOutcome::Fatal(SystemError::QueueUnreachable(reason))
            }
        };

        info!("Submitted {} as job {}", binding.label, id);

        let poll = async {
            let mut interval = tokio::time::interval(settings.poll_interval);
            loop {
                interval.tick().await;
                match backend.poll(&id).await {
                    Ok(status) if status.is_terminal() => return Ok(status),
                    Ok(status) => debug!("Job {} ({}): {:?}", id, binding.label, status),
                    Err(e) => return Err(e),
                }
            }
        };

        tokio::select! {
            polled = poll => match polled {
                Ok(QueueStatus::Completed) => JobOutcome::Succeeded,
                Ok(QueueStatus::TimedOut) => JobOutcome::Failed {
                    error: timeout_error(binding),
                    diagnostics: log_tail(&log_path),
                },
                Ok(QueueStatus::Failed { exit_code }) => JobOutcome::Failed {
                    error: ExecutionError::NonZeroExit { label: binding.label.clone(), code: exit_code },
                    diagnostics: log_tail(&log_path),
                },
                Ok(QueueStatus::Cancelled) => JobOutcome::failed(ExecutionError::NonZeroExit {
                    label: binding.label.clone(),
                    code: -1,
                }),
                Ok(QueueStatus::Queued | QueueStatus::Running) => JobOutcome::Succeeded,
                Err(e) => JobOutcome::Fatal(SystemError::QueueUnreachable(e.to_string())),
            },
            // The wall time is enforced by the queue (`--time`), which
            // does not count time spent waiting for a node.
            _ = cancelled(cancel_rx) => {
                release(backend.as_ref(), &id).await;
                JobOutcome::Cancelled
            }
        }
    }
}

async fn release(backend: &dyn QueueBackend, id: &JobId) {
    if let Err(e) = backend.cancel(id).await {
        warn!("Failed to cancel job {}: {}", id, e);
    }
}

/// Resource hints exported to local jobs as environment advice.
fn resource_environment(binding: &Binding) -> Vec<(&'static str, String)> {
    let threads = binding.hints.threads.to_string();
    let mut env = vec![("ONTVC_THREADS", threads.clone()), ("OMP_NUM_THREADS", threads)];
    if let Some(queue) = &binding.hints.queue {
        env.push(("ONTVC_QUEUE", queue.clone()));
    }
    if let Some(memory) = &binding.hints.memory {
        env.push(("ONTVC_MEMORY", memory.clone()));
    }
    env
}

/// Creates parent directories for output files.
fn ensure_output_directories(outputs: &[PathBuf], working_dir: &Path) -> std::io::Result<()> {
    for output in outputs {
        if let Some(parent) = working_dir.join(output).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Modification times of the declared outputs, `None` for missing ones.
fn output_times(outputs: &[PathBuf], working_dir: &Path) -> Vec<(PathBuf, Option<SystemTime>)> {
    outputs
        .iter()
        .map(|output| {
            let path = working_dir.join(output);
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
            (path, modified)
        })
        .collect()
}

/// Deletes outputs created or modified since `previous` was recorded.
fn remove_partial_outputs(label: &str, previous: &[(PathBuf, Option<SystemTime>)]) {
    for (path, before) in previous {
        let now = fs::metadata(path).and_then(|m| m.modified()).ok();
        if now.is_none() || now == *before {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => warn!("{}: removed incomplete output {}", label, path.display()),
            Err(e) => warn!("{}: cannot remove incomplete output {}: {}", label, path.display(), e),
        }
    }
}

/// Queue-safe job name derived from an instance label.
fn job_name(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect::<String>()
        .trim_end_matches('_')
        .to_string()
}

/// Writes the job script submitted to the queue.
fn write_job_script(
    log_dir: &Path,
    name: &str,
    command: &str,
    working_dir: &Path,
    binding: &Binding,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;

    let script_path = log_dir.join(format!("{}.sh", name));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/sh")?;
    writeln!(file, "set -e")?;
    for (key, value) in resource_environment(binding) {
        writeln!(file, "export {}='{}'", key, value)?;
    }
    writeln!(file, "cd '{}'", working_dir.display())?;
    writeln!(file, "{}", command)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Last lines of a queue log, if it can be read.
fn log_tail(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::queue::QueueFuture;
    use crate::workflow::ResourceHints;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn binding(label: &str, outputs: &[&str]) -> Binding {
        Binding {
            label: label.into(),
            inputs: Vec::new(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            hints: ResourceHints::default(),
        }
    }

    fn command_job(label: &str, outputs: &[&str], cmd: &str) -> Job {
        Job {
            binding: binding(label, outputs),
            runnable: Runnable::Command(cmd.into()),
        }
    }

    #[tokio::test]
    async fn test_local_command_success_creates_output_dirs() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 2);

        let mut handle = executor.submit(command_job(
            "write[a]",
            &["nested/dir/out.txt"],
            "echo hello > nested/dir/out.txt",
        ));

        assert!(matches!(handle.wait().await, JobOutcome::Succeeded));
        let content = fs::read_to_string(temp_dir.path().join("nested/dir/out.txt")).unwrap();
        assert_eq!(content.trim(), "hello");
    }

    #[tokio::test]
    async fn test_local_command_failure_keeps_stderr() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let mut handle = executor.submit(command_job("bad[a]", &[], "echo broken >&2; exit 3"));

        match handle.wait().await {
            JobOutcome::Failed { error, diagnostics } => {
                assert_eq!(
                    error,
                    ExecutionError::NonZeroExit {
                        label: "bad[a]".into(),
                        code: 3
                    }
                );
                assert_eq!(diagnostics, vec!["broken".to_string()]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resource_hints_exported() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let mut job = command_job("env[a]", &["env.txt"], "echo $ONTVC_THREADS $OMP_NUM_THREADS $ONTVC_QUEUE > env.txt");
        job.binding.hints.threads = 6;
        job.binding.hints.queue = Some("gpu".into());

        let mut handle = executor.submit(job);
        assert!(matches!(handle.wait().await, JobOutcome::Succeeded));

        let content = fs::read_to_string(temp_dir.path().join("env.txt")).unwrap();
        assert_eq!(content.trim(), "6 6 gpu");
    }

    #[tokio::test]
    async fn test_wall_time_exceeded() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let mut job = command_job("slow[a]", &[], "sleep 5");
        job.binding.hints.wall_time = Some(Duration::from_millis(100));

        let mut handle = executor.submit(job);
        match handle.wait().await {
            JobOutcome::Failed { error, .. } => {
                assert!(matches!(error, ExecutionError::TimeoutExceeded { .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_removes_outputs_it_wrote() {
        let temp_dir = tempdir().unwrap();
        let untouched = temp_dir.path().join("untouched.txt");
        let rewritten = temp_dir.path().join("rewritten.txt");
        fs::write(&untouched, "old").unwrap();
        fs::write(&rewritten, "old").unwrap();
        File::options()
            .write(true)
            .open(&rewritten)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000))
            .unwrap();

        let executor = Executor::local(temp_dir.path(), 1);
        let job = command_job(
            "partial[a]",
            &["out/new.txt", "rewritten.txt", "untouched.txt"],
            "echo half > out/new.txt; echo half > rewritten.txt; exit 1",
        );

        match executor.submit(job).wait().await {
            JobOutcome::Failed { error, .. } => {
                assert!(matches!(error, ExecutionError::NonZeroExit { code: 1, .. }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!temp_dir.path().join("out/new.txt").exists());
        assert!(!rewritten.exists());
        assert_eq!(fs::read_to_string(&untouched).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_timed_out_attempt_removes_outputs() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let mut job = command_job("slow[a]", &["out.txt"], "echo started > out.txt; sleep 5");
        job.binding.hints.wall_time = Some(Duration::from_millis(200));

        assert!(matches!(executor.submit(job).wait().await, JobOutcome::Failed { .. }));
        assert!(!temp_dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let mut handle = executor.submit(command_job("long[a]", &[], "sleep 30"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.cancel(&mut handle);

        let outcome = tokio::time::timeout(Duration::from_secs(5), executor.wait(&mut handle))
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1).with_dry_run(true);

        let mut handle = executor.submit(command_job("w[a]", &["out/x.txt"], "touch out/x.txt"));
        assert!(matches!(handle.wait().await, JobOutcome::Succeeded));
        assert!(!temp_dir.path().join("out").exists());
        assert!(executor.is_dry_run());
    }

    #[tokio::test]
    async fn test_callable_error_is_action_failure() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);

        let job = Job {
            binding: binding("fn[a]", &[]),
            runnable: Runnable::Callable(Arc::new(|| Err("no good".to_string()))),
        };
        match executor.submit(job).wait().await {
            JobOutcome::Failed { error, .. } => assert_eq!(
                error,
                ExecutionError::Action {
                    label: "fn[a]".into(),
                    reason: "no good".into()
                }
            ),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timed_out_callable_keeps_its_slot() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let handles: Vec<JobHandle> = (0..3)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let finished = Arc::clone(&finished);
                let mut b = binding(&format!("sleepy[{}]", i), &[]);
                b.hints.wall_time = Some(Duration::from_millis(50));
                executor.submit(Job {
                    binding: b,
                    runnable: Runnable::Callable(Arc::new(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(300));
                        active.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })),
                })
            })
            .collect();

        for (waited, mut handle) in handles.into_iter().enumerate() {
            match handle.wait().await {
                JobOutcome::Failed { error, .. } => assert_eq!(
                    error,
                    ExecutionError::TimeoutExceeded {
                        label: format!("sleepy[{}]", waited),
                        budget: Duration::from_millis(50),
                    }
                ),
                other => panic!("unexpected outcome {:?}", other),
            }
            // Reported only once the closure returned.
            assert!(finished.load(Ordering::SeqCst) > waited);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_slots_bound_concurrency() {
        let temp_dir = tempdir().unwrap();
        let executor = Executor::local(temp_dir.path(), 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<JobHandle> = (0..5)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                executor.submit(Job {
                    binding: binding(&format!("c[{}]", i), &[]),
                    runnable: Runnable::Callable(Arc::new(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })),
                })
            })
            .collect();

        for mut handle in handles {
            assert!(matches!(handle.wait().await, JobOutcome::Succeeded));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.capacity(), 2);
    }

    /// Queue that records submissions and replays scripted statuses.
    struct FakeQueue {
        submitted: Mutex<Vec<SubmitRequest>>,
        statuses: Mutex<VecDeque<QueueStatus>>,
        cancelled: AtomicUsize,
        reject: bool,
        unreachable: bool,
    }

    impl FakeQueue {
        fn new(statuses: Vec<QueueStatus>) -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                statuses: Mutex::new(statuses.into()),
                cancelled: AtomicUsize::new(0),
                reject: false,
                unreachable: false,
            }
        }
    }

    impl QueueBackend for FakeQueue {
        fn submit<'a>(&'a self, request: &'a SubmitRequest) -> QueueFuture<'a, JobId> {
            Box::pin(async move {
                if self.unreachable {
                    return Err(QueueError::Unreachable("connection refused".into()));
                }
                if self.reject {
                    return Err(QueueError::Rejected("invalid partition".into()));
                }
                let mut submitted = self.submitted.lock().unwrap();
                submitted.push(request.clone());
                Ok(JobId(submitted.len().to_string()))
            })
        }

        fn poll<'a>(&'a self, _id: &'a JobId) -> QueueFuture<'a, QueueStatus> {
            Box::pin(async move {
                Ok(self
                    .statuses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(QueueStatus::Running))
            })
        }

        fn cancel<'a>(&'a self, _id: &'a JobId) -> QueueFuture<'a, ()> {
            Box::pin(async move {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn cluster(dir: &Path, queue: Arc<FakeQueue>) -> Executor {
        Executor::cluster(
            dir,
            1,
            ClusterSettings {
                backend: queue,
                poll_interval: Duration::from_millis(10),
                log_dir: PathBuf::from("log.dir"),
                default_queue: Some("all.q".into()),
                max_pending_submissions: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_cluster_submit_and_poll() {
        let temp_dir = tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![
            QueueStatus::Queued,
            QueueStatus::Running,
            QueueStatus::Completed,
        ]));
        let executor = cluster(temp_dir.path(), Arc::clone(&queue));
        assert_eq!(executor.capacity(), 3);

        let mut handle = executor.submit(command_job("map[s1]", &["mapped.dir/s1.bam"], "true"));
        assert!(matches!(handle.wait().await, JobOutcome::Succeeded));

        let submitted = queue.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "map_s1");
        assert_eq!(submitted[0].queue.as_deref(), Some("all.q"));

        let script = fs::read_to_string(&submitted[0].script).unwrap();
        assert!(script.contains("set -e"));
        assert!(script.ends_with("true\n"));
        assert!(temp_dir.path().join("mapped.dir").is_dir());
    }

    #[tokio::test]
    async fn test_cluster_failure_and_rejection() {
        let temp_dir = tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![QueueStatus::Failed { exit_code: 137 }]));
        let executor = cluster(temp_dir.path(), queue);

        match executor.submit(command_job("x[a]", &[], "false")).wait().await {
            JobOutcome::Failed { error, .. } => assert_eq!(
                error,
                ExecutionError::NonZeroExit {
                    label: "x[a]".into(),
                    code: 137
                }
            ),
            other => panic!("unexpected outcome {:?}", other),
        }

        let mut rejecting = FakeQueue::new(Vec::new());
        rejecting.reject = true;
        let executor = cluster(temp_dir.path(), Arc::new(rejecting));
        match executor.submit(command_job("y[a]", &[], "true")).wait().await {
            JobOutcome::Failed { error, .. } => {
                assert!(matches!(error, ExecutionError::SubmissionError { .. }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cluster_unreachable_is_fatal() {
        let temp_dir = tempdir().unwrap();
        let mut queue = FakeQueue::new(Vec::new());
        queue.unreachable = true;
        let executor = cluster(temp_dir.path(), Arc::new(queue));

        let outcome = executor.submit(command_job("z[a]", &[], "true")).wait().await;
        assert!(matches!(
            outcome,
            JobOutcome::Fatal(SystemError::QueueUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_cluster_queue_wait_not_charged_to_wall_time() {
        let temp_dir = tempdir().unwrap();
        let mut statuses = vec![QueueStatus::Queued; 15];
        statuses.push(QueueStatus::Running);
        statuses.push(QueueStatus::Completed);
        let queue = Arc::new(FakeQueue::new(statuses));
        let executor = cluster(temp_dir.path(), Arc::clone(&queue));

        let mut job = command_job("call[s1]", &[], "true");
        job.binding.hints.wall_time = Some(Duration::from_millis(30));

        assert!(matches!(executor.submit(job).wait().await, JobOutcome::Succeeded));
        assert_eq!(queue.cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.submitted.lock().unwrap()[0].wall_time,
            Some(Duration::from_millis(30))
        );
    }

    #[tokio::test]
    async fn test_cluster_cancel_releases_job() {
        let temp_dir = tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(Vec::new()));
        let executor = cluster(temp_dir.path(), Arc::clone(&queue));

        let mut handle = executor.submit(command_job("w[a]", &[], "sleep 100"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert!(matches!(handle.wait().await, JobOutcome::Cancelled));
        assert_eq!(queue.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_job_name_sanitised() {
        assert_eq!(job_name("run_mapping[s1]"), "run_mapping_s1");
        assert_eq!(job_name("split[s:s.chr1.bam]"), "split_s_s_chr1_bam");
    }

    #[test]
    fn test_log_tail_keeps_last_lines() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("job.log");
        let content: Vec<String> = (0..80).map(|i| format!("line {}", i)).collect();
        fs::write(&path, content.join("\n")).unwrap();

        let tail = log_tail(&path);
        assert_eq!(tail.len(), DIAGNOSTIC_LINES);
        assert_eq!(tail[0], "line 30");
        assert!(log_tail(&temp_dir.path().join("missing.log")).is_empty());
    }
}
