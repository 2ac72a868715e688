//! Staleness Checker
//!
//! Decides whether a task instance has to run, based on the modification
//! times recorded in the filesystem snapshot and on whether any upstream
//! instance executed during this run.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use log::debug;

use super::graph::TaskInstance;
use super::snapshot::Snapshot;

/// Why an instance needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The task declares no outputs, so there is nothing to compare
    NoOutputs,
    MissingOutput(PathBuf),
    /// An output is strictly older than an input
    OutputOlderThanInput { output: PathBuf, input: PathBuf },
    /// A predecessor executed in this run
    UpstreamExecuted(String),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOutputs => write!(f, "no declared outputs"),
            Self::MissingOutput(path) => write!(f, "missing output {}", path.display()),
            Self::OutputOlderThanInput { output, input } => write!(
                f,
                "{} is older than {}",
                output.display(),
                input.display()
            ),
            Self::UpstreamExecuted(label) => write!(f, "upstream {} executed", label),
        }
    }
}

/// Result of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale(StaleReason),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

/// Compares instance inputs and outputs against a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StalenessChecker<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> StalenessChecker<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    /// Checks one instance.
    ///
    /// `executed_upstream` is the label of a predecessor that actually ran
    /// in this run, if any.
    pub fn check(&self, instance: &TaskInstance, executed_upstream: Option<&str>) -> Staleness {
        let result = self.evaluate(instance, executed_upstream);
        debug!("{}: {:?}", instance.label, result);
        result
    }

    fn evaluate(&self, instance: &TaskInstance, executed_upstream: Option<&str>) -> Staleness {
        if let Some(label) = executed_upstream {
            return Staleness::Stale(StaleReason::UpstreamExecuted(label.to_string()));
        }

        if instance.outputs.is_empty() {
            // Targets only re-run when something below them did.
            if instance.action.is_noop() {
                return Staleness::Fresh;
            }
            return Staleness::Stale(StaleReason::NoOutputs);
        }

        let mut oldest_output: Option<(&PathBuf, SystemTime)> = None;
        for output in &instance.outputs {
            match self.snapshot.mtime(output) {
                None => return Staleness::Stale(StaleReason::MissingOutput(output.clone())),
                Some(time) => {
                    if oldest_output.map_or(true, |(_, oldest)| time < oldest) {
                        oldest_output = Some((output, time));
                    }
                }
            }
        }

        // Inputs unknown to the snapshot are ignored.
        let newest_input = instance
            .inputs
            .iter()
            .filter_map(|input| self.snapshot.mtime(input).map(|t| (input, t)))
            .max_by_key(|(_, t)| *t);

        if let (Some((output, out_time)), Some((input, in_time))) = (oldest_output, newest_input) {
            if out_time < in_time {
                return Staleness::Stale(StaleReason::OutputOlderThanInput {
                    output: output.clone(),
                    input: input.clone(),
                });
            }
        }

        Staleness::Fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::action::{Action, NoopAction, ShellAction};
    use crate::workflow::ResourceHints;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn instance(inputs: &[&str], outputs: &[&str], action: Arc<dyn Action>) -> TaskInstance {
        TaskInstance {
            id: 0,
            task: "t".into(),
            label: "t[x]".into(),
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            predecessors: Vec::new(),
            hints: ResourceHints::default(),
            action,
            retries: 0,
        }
    }

    fn shell() -> Arc<dyn Action> {
        Arc::new(ShellAction::new("true"))
    }

    #[test]
    fn test_missing_output_is_stale() {
        let snap = Snapshot::from_entries(vec![(PathBuf::from("in.txt"), at(10))]);
        let checker = StalenessChecker::new(&snap);

        let result = checker.check(&instance(&["in.txt"], &["out.txt"], shell()), None);
        assert_eq!(
            result,
            Staleness::Stale(StaleReason::MissingOutput(PathBuf::from("out.txt")))
        );
    }

    #[test]
    fn test_newer_output_is_fresh() {
        let snap = Snapshot::from_entries(vec![
            (PathBuf::from("in.txt"), at(10)),
            (PathBuf::from("out.txt"), at(20)),
        ]);
        let checker = StalenessChecker::new(&snap);

        assert_eq!(
            checker.check(&instance(&["in.txt"], &["out.txt"], shell()), None),
            Staleness::Fresh
        );
    }

    #[test]
    fn test_equal_mtimes_are_fresh() {
        let snap = Snapshot::from_entries(vec![
            (PathBuf::from("in.txt"), at(10)),
            (PathBuf::from("out.txt"), at(10)),
        ]);
        let checker = StalenessChecker::new(&snap);

        assert!(!checker
            .check(&instance(&["in.txt"], &["out.txt"], shell()), None)
            .is_stale());
    }

    #[test]
    fn test_older_output_is_stale() {
        let snap = Snapshot::from_entries(vec![
            (PathBuf::from("a.txt"), at(10)),
            (PathBuf::from("b.txt"), at(30)),
            (PathBuf::from("out1.txt"), at(40)),
            (PathBuf::from("out2.txt"), at(20)),
        ]);
        let checker = StalenessChecker::new(&snap);

        let result = checker.check(
            &instance(&["a.txt", "b.txt"], &["out1.txt", "out2.txt"], shell()),
            None,
        );
        assert_eq!(
            result,
            Staleness::Stale(StaleReason::OutputOlderThanInput {
                output: PathBuf::from("out2.txt"),
                input: PathBuf::from("b.txt"),
            })
        );
    }

    #[test]
    fn test_unknown_input_ignored() {
        let snap = Snapshot::from_entries(vec![(PathBuf::from("out.txt"), at(5))]);
        let checker = StalenessChecker::new(&snap);

        assert_eq!(
            checker.check(&instance(&["gone.txt"], &["out.txt"], shell()), None),
            Staleness::Fresh
        );
    }

    #[test]
    fn test_upstream_execution_forces_rerun() {
        let snap = Snapshot::from_entries(vec![
            (PathBuf::from("in.txt"), at(10)),
            (PathBuf::from("out.txt"), at(20)),
        ]);
        let checker = StalenessChecker::new(&snap);

        let result = checker.check(&instance(&["in.txt"], &["out.txt"], shell()), Some("up[x]"));
        assert_eq!(
            result,
            Staleness::Stale(StaleReason::UpstreamExecuted("up[x]".into()))
        );
    }

    #[test]
    fn test_no_outputs() {
        let snap = Snapshot::default();
        let checker = StalenessChecker::new(&snap);

        assert_eq!(
            checker.check(&instance(&[], &[], shell()), None),
            Staleness::Stale(StaleReason::NoOutputs)
        );
        assert_eq!(
            checker.check(&instance(&[], &[], Arc::new(NoopAction)), None),
            Staleness::Fresh
        );
        assert!(checker
            .check(&instance(&[], &[], Arc::new(NoopAction)), Some("work[a]"))
            .is_stale());
    }

    #[test]
    fn test_reason_display() {
        let reason = StaleReason::MissingOutput(PathBuf::from("x.bam"));
        assert_eq!(reason.to_string(), "missing output x.bam");
    }
}
