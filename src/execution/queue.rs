//! Cluster Queue Interface
//!
//! Client side of a batch queue: submit a job script, poll its status and
//! cancel it. The executor only talks to the [`QueueBackend`] trait, so a
//! different scheduler (or a fake in tests) can be plugged in.
//!
//! [`SlurmQueue`] drives `sbatch`, `sacct` and `scancel`. The command
//! names are configurable; output parsing is kept in pure functions.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::process::Command;

/// Identifier assigned by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to submit one job script.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub name: String,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub threads: usize,
    pub queue: Option<String>,
    pub memory: Option<String>,
    pub wall_time: Option<Duration>,
    /// Passed through verbatim, split on whitespace
    pub job_options: Option<String>,
}

/// State of a submitted job as reported by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed { exit_code: i32 },
    TimedOut,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Queue client failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The queue answered but refused the request
    #[error("rejected by queue: {0}")]
    Rejected(String),

    /// The queue could not be reached at all
    #[error("queue unreachable: {0}")]
    Unreachable(String),
}

pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Batch queue client.
pub trait QueueBackend: Send + Sync {
    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> QueueFuture<'a, JobId>;

    fn poll<'a>(&'a self, id: &'a JobId) -> QueueFuture<'a, QueueStatus>;

    fn cancel<'a>(&'a self, id: &'a JobId) -> QueueFuture<'a, ()>;
}

/// Slurm client built on the standard command-line tools.
#[derive(Debug, Clone)]
pub struct SlurmQueue {
    submit_command: String,
    poll_command: String,
    cancel_command: String,
}

impl Default for SlurmQueue {
    fn default() -> Self {
        Self::new("sbatch", "sacct", "scancel")
    }
}

impl SlurmQueue {
    pub fn new(
        submit_command: impl Into<String>,
        poll_command: impl Into<String>,
        cancel_command: impl Into<String>,
    ) -> Self {
        Self {
            submit_command: submit_command.into(),
            poll_command: poll_command.into(),
            cancel_command: cancel_command.into(),
        }
    }

    /// Arguments passed to the submit command.
    pub fn submit_args(request: &SubmitRequest) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", request.name),
            format!("--cpus-per-task={}", request.threads.max(1)),
            format!("--chdir={}", request.working_dir.display()),
            format!("--output={}", request.log_path.display()),
        ];

        if let Some(queue) = &request.queue {
            args.push(format!("--partition={}", queue));
        }
        if let Some(memory) = &request.memory {
            args.push(format!("--mem={}", memory));
        }
        if let Some(wall_time) = request.wall_time {
            args.push(format!("--time={}", format_wall_time(wall_time)));
        }
        if let Some(options) = &request.job_options {
            args.extend(options.split_whitespace().map(str::to_string));
        }

        args.push(request.script.display().to_string());
        args
    }

    async fn invoke(&self, program: &str, args: &[String]) -> Result<std::process::Output, QueueError> {
        debug!("{} {}", program, args.join(" "));

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| QueueError::Unreachable(format!("{}: {}", program, e)))
    }
}

impl QueueBackend for SlurmQueue {
    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> QueueFuture<'a, JobId> {
        Box::pin(async move {
            let output = self
                .invoke(&self.submit_command, &Self::submit_args(request))
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(QueueError::Rejected(stderr));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_submit_output(&stdout).ok_or_else(|| {
                QueueError::Rejected(format!("unexpected submit output '{}'", stdout.trim()))
            })
        })
    }

    fn poll<'a>(&'a self, id: &'a JobId) -> QueueFuture<'a, QueueStatus> {
        Box::pin(async move {
            let args = vec![
                "-j".to_string(),
                id.0.clone(),
                "--format=State,ExitCode".to_string(),
                "--noheader".to_string(),
                "--parsable2".to_string(),
            ];
            let output = self.invoke(&self.poll_command, &args).await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(QueueError::Unreachable(stderr));
            }

            Ok(parse_accounting(&String::from_utf8_lossy(&output.stdout)))
        })
    }

    fn cancel<'a>(&'a self, id: &'a JobId) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let output = self.invoke(&self.cancel_command, &[id.0.clone()]).await?;
            if !output.status.success() {
                warn!(
                    "Cancelling job {} failed: {}",
                    id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}

/// Parses `sbatch --parsable` output (`<id>` or `<id>;<cluster>`).
pub fn parse_submit_output(stdout: &str) -> Option<JobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();

    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(JobId(id.to_string()))
    } else {
        None
    }
}

/// Parses `sacct --parsable2 --noheader --format=State,ExitCode` output.
///
/// The first line describes the allocation; job steps follow. An empty
/// answer means the accounting record does not exist yet.
pub fn parse_accounting(stdout: &str) -> QueueStatus {
    let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return QueueStatus::Queued;
    };

    let mut fields = line.split('|');
    let state = fields.next().unwrap_or_default();
    let exit_code = fields
        .next()
        .and_then(|code| code.split(':').next())
        .and_then(|code| code.parse::<i32>().ok())
        .unwrap_or(1);

    parse_state(state, exit_code)
}

fn parse_state(state: &str, exit_code: i32) -> QueueStatus {
    // "CANCELLED by 1234"
    let keyword = state.split_whitespace().next().unwrap_or_default();

    match keyword {
        "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => QueueStatus::Queued,
        "RUNNING" | "COMPLETING" | "CONFIGURING" => QueueStatus::Running,
        "COMPLETED" => QueueStatus::Completed,
        "TIMEOUT" | "DEADLINE" => QueueStatus::TimedOut,
        "CANCELLED" | "PREEMPTED" => QueueStatus::Cancelled,
        "" => QueueStatus::Queued,
        _ => QueueStatus::Failed {
            exit_code: if exit_code == 0 { 1 } else { exit_code },
        },
    }
}

/// Formats a duration as `HH:MM:SS`; hours may exceed 24.
pub fn format_wall_time(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            name: "run_mapping_s1".into(),
            script: PathBuf::from("/work/log/run_mapping_s1.sh"),
            working_dir: PathBuf::from("/work"),
            log_path: PathBuf::from("/work/log/run_mapping_s1.log"),
            threads: 4,
            queue: Some("all.q".into()),
            memory: Some("16G".into()),
            wall_time: Some(Duration::from_secs(24 * 3600)),
            job_options: Some("--gres=gpu:1  --qos=long".into()),
        }
    }

    #[test]
    fn test_submit_args() {
        let args = SlurmQueue::submit_args(&request());

        assert_eq!(args[0], "--parsable");
        assert!(args.contains(&"--cpus-per-task=4".to_string()));
        assert!(args.contains(&"--partition=all.q".to_string()));
        assert!(args.contains(&"--mem=16G".to_string()));
        assert!(args.contains(&"--time=24:00:00".to_string()));
        assert!(args.contains(&"--gres=gpu:1".to_string()));
        assert!(args.contains(&"--qos=long".to_string()));
        assert_eq!(args.last().unwrap(), "/work/log/run_mapping_s1.sh");
    }

    #[test]
    fn test_submit_args_without_optional_hints() {
        let mut req = request();
        req.queue = None;
        req.memory = None;
        req.wall_time = None;
        req.job_options = None;

        let args = SlurmQueue::submit_args(&req);
        assert_eq!(args.len(), 6);
        assert!(!args.iter().any(|a| a.starts_with("--partition")));
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(parse_submit_output("12345\n"), Some(JobId("12345".into())));
        assert_eq!(parse_submit_output("678;cluster1"), Some(JobId("678".into())));
        assert_eq!(parse_submit_output(""), None);
        assert_eq!(parse_submit_output("Submitted batch job"), None);
    }

    #[test]
    fn test_parse_accounting_states() {
        assert_eq!(parse_accounting(""), QueueStatus::Queued);
        assert_eq!(parse_accounting("PENDING|0:0\n"), QueueStatus::Queued);
        assert_eq!(parse_accounting("RUNNING|0:0"), QueueStatus::Running);
        assert_eq!(
            parse_accounting("COMPLETED|0:0\nCOMPLETED|0:0\n"),
            QueueStatus::Completed
        );
        assert_eq!(
            parse_accounting("FAILED|2:0"),
            QueueStatus::Failed { exit_code: 2 }
        );
        assert_eq!(parse_accounting("TIMEOUT|0:15"), QueueStatus::TimedOut);
        assert_eq!(
            parse_accounting("CANCELLED by 1001|0:15"),
            QueueStatus::Cancelled
        );
    }

    #[test]
    fn test_out_of_memory_is_failure() {
        assert_eq!(
            parse_accounting("OUT_OF_MEMORY|0:125"),
            QueueStatus::Failed { exit_code: 1 }
        );
        assert_eq!(
            parse_accounting("NODE_FAIL|garbage"),
            QueueStatus::Failed { exit_code: 1 }
        );
    }

    #[test]
    fn test_format_wall_time() {
        assert_eq!(format_wall_time(Duration::from_secs(48 * 3600)), "48:00:00");
        assert_eq!(format_wall_time(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Running.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed { exit_code: 3 }.is_terminal());
    }

    #[tokio::test]
    async fn test_missing_submit_command_is_unreachable() {
        let queue = SlurmQueue::new("/nonexistent/ontvc-sbatch", "sacct", "scancel");
        let err = queue.submit(&request()).await.unwrap_err();
        assert!(matches!(err, QueueError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_failing_submit_command_is_rejection() {
        // `false` runs and exits non-zero, like a refused submission.
        let queue = SlurmQueue::new("false", "sacct", "scancel");
        let err = queue.submit(&request()).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
    }
}
