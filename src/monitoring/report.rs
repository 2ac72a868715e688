//! Run Report
//!
//! Final per-instance outcome of a run. The report is what the CLI prints
//! and, on request, writes as JSON next to the pipeline outputs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use colored::Colorize;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::SystemError;
use crate::execution::state::{InstanceState, SkipReason};

/// Outcome of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub label: String,
    pub task: String,
    pub state: InstanceState,
    /// Number of times the job was dispatched
    pub attempts: u32,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Why the instance was considered out of date, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
    /// Error and trailing stderr lines of the last failed attempt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub dry_run: bool,
    /// Cancellation was requested from outside (e.g. Ctrl-C)
    pub cancelled: bool,
    /// System error that aborted the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// Instances in topological order
    pub instances: Vec<InstanceReport>,
}

/// Number of instances per final state class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub succeeded: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub unfinished: usize,
}

impl RunReport {
    /// True if every instance succeeded or was already up to date, and the
    /// run was neither cancelled nor aborted.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.aborted.is_none() && self.instances.iter().all(|i| i.state.is_satisfied())
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for instance in &self.instances {
            match &instance.state {
                InstanceState::Succeeded => counts.succeeded += 1,
                InstanceState::Skipped(SkipReason::UpToDate) => counts.up_to_date += 1,
                InstanceState::Skipped(SkipReason::Cancelled) => counts.cancelled += 1,
                InstanceState::Failed(_) => counts.failed += 1,
                _ => counts.unfinished += 1,
            }
        }
        counts
    }

    pub fn instance(&self, label: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.label == label)
    }

    /// Labels of the instances that ran to success in this run.
    pub fn executed(&self) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Succeeded)
            .map(|i| i.label.as_str())
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &InstanceReport> {
        self.instances.iter().filter(|i| i.state.is_failed())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let counts = self.counts();
        let mut out = String::new();

        let headline = if self.is_success() {
            if self.dry_run {
                "Dry run completed".green().bold()
            } else {
                "Pipeline completed successfully".green().bold()
            }
        } else if self.cancelled {
            "Pipeline cancelled".yellow().bold()
        } else {
            "Pipeline failed".red().bold()
        };
        out.push_str(&format!("{}\n", headline));

        if let Some(reason) = &self.aborted {
            out.push_str(&format!("  {} {}\n", "aborted:".red(), reason));
        }

        out.push_str(&format!(
            "  {} executed, {} up to date, {} failed, {} cancelled",
            counts.succeeded, counts.up_to_date, counts.failed, counts.cancelled
        ));
        if counts.unfinished > 0 {
            out.push_str(&format!(", {} unfinished", counts.unfinished));
        }
        out.push('\n');

        let seconds = self.duration().num_milliseconds() as f64 / 1000.0;
        out.push_str(&format!("  Total time: {:.2}s\n", seconds));

        for instance in self.failed() {
            out.push_str(&format!(
                "\n  {} {}: {}\n",
                "✗".red(),
                instance.label.bold(),
                instance.state
            ));
            for line in &instance.diagnostics {
                out.push_str(&format!("      {}\n", line.dimmed()));
            }
        }

        out
    }

    /// Writes the report as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), SystemError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SystemError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        fs::write(path, json)?;

        info!("Saved run report to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SystemError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| SystemError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}
