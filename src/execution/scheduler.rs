//! Scheduler Loop
//!
//! Walks the instance graph, dispatching stale instances to the executor
//! as soon as all their predecessors are done, and collecting completions
//! until nothing more can run.
//!
//! The scheduler is the only owner of the run state. Jobs report back over
//! a single mpsc channel and completions are applied one at a time, so no
//! locking is needed.
//!
//! # Failure handling
//!
//! - A failed attempt is retried while the task's retry budget lasts
//! - Dependents of a failed instance become
//!   `Failed(BlockedByUpstreamFailure)`; independent branches keep running
//! - With fail-fast, the first failure cancels the whole run
//! - Cancellation kills running jobs (`Failed(Cancelled)`) and skips
//!   everything not yet started (`Skipped(Cancelled)`)

use std::collections::HashMap;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use super::executor::{Executor, Job, JobOutcome};
use super::state::{FailureReason, InstanceState, SkipReason};
use crate::monitoring::{EventType, ExecutionTimeline, InstanceReport, RunReport};
use crate::workflow::{Dag, InstanceId, Snapshot, Staleness, StalenessChecker};

/// A finished job, as reported back to the scheduler.
#[derive(Debug)]
struct Completion {
    id: InstanceId,
    outcome: JobOutcome,
}

enum Event {
    Completed(Completion),
    /// `false` once the cancellation sender is dropped
    CancelSignal(bool),
    Closed,
}

/// Drives one run over a DAG.
pub struct Scheduler<'a> {
    dag: &'a Dag,
    checker: StalenessChecker<'a>,
    executor: Executor,
    fail_fast: bool,
    cancel: watch::Receiver<bool>,

    states: Vec<InstanceState>,
    attempts: Vec<u32>,
    executed: Vec<bool>,
    stale_reasons: Vec<Option<String>>,
    diagnostics: Vec<Vec<String>>,
    cancellers: HashMap<InstanceId, oneshot::Sender<()>>,
    running: usize,
    cancelling: bool,
    cancelled_externally: bool,
    aborted: Option<String>,
    timeline: ExecutionTimeline,
}

impl<'a> Scheduler<'a> {
    pub fn new(dag: &'a Dag, snapshot: &'a Snapshot, executor: Executor, cancel: watch::Receiver<bool>) -> Self {
        let n = dag.len();
        Self {
            dag,
            checker: StalenessChecker::new(snapshot),
            executor,
            fail_fast: false,
            cancel,
            states: vec![InstanceState::Pending; n],
            attempts: vec![0; n],
            executed: vec![false; n],
            stale_reasons: vec![None; n],
            diagnostics: vec![Vec::new(); n],
            cancellers: HashMap::new(),
            running: 0,
            cancelling: false,
            cancelled_externally: false,
            aborted: None,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Cancels the whole run on the first failure.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Runs until every instance is terminal or nothing more can progress.
    pub async fn run(&mut self) -> RunReport {
        let started_at = Local::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut cancel_open = true;

        info!(
            "Scheduling {} instances (capacity {}, fail fast: {}, dry run: {})",
            self.dag.len(),
            self.executor.capacity(),
            self.fail_fast,
            self.executor.is_dry_run()
        );

        if *self.cancel.borrow() {
            self.begin_cancel(true);
        }

        loop {
            if !self.cancelling {
                self.advance(&tx);
            }

            if self.running == 0 {
                break;
            }

            let event = tokio::select! {
                Some(completion) = rx.recv() => Event::Completed(completion),
                changed = self.cancel.changed(), if cancel_open => Event::CancelSignal(changed.is_ok()),
                else => Event::Closed,
            };

            match event {
                Event::Completed(completion) => self.complete(completion, &tx),
                Event::CancelSignal(true) => {
                    if *self.cancel.borrow() && !self.cancelling {
                        warn!("Cancellation requested");
                        self.begin_cancel(true);
                    }
                }
                // Sender gone; the run can no longer be cancelled externally.
                Event::CancelSignal(false) => cancel_open = false,
                Event::Closed => break,
            }
        }

        // Anything left over can no longer progress.
        for state in self.states.iter_mut() {
            if !state.is_terminal() {
                *state = InstanceState::Skipped(SkipReason::Cancelled);
            }
        }

        self.report(started_at)
    }

    /// Promotes pending instances and dispatches ready ones until nothing
    /// changes. Up-to-date instances are resolved on the spot, which may
    /// unblock their dependents in the same pass.
    fn advance(&mut self, tx: &mpsc::UnboundedSender<Completion>) {
        let dag = self.dag;
        loop {
            let mut progressed = false;

            for &id in dag.topological_order() {
                if self.states[id] == InstanceState::Pending {
                    if let Some(state) = self.promote(id) {
                        self.states[id] = state;
                        progressed = true;
                    }
                }

                if self.states[id] == InstanceState::Ready && self.running < self.executor.capacity() {
                    self.start(id, tx);
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// New state for a pending instance whose predecessors are all
    /// terminal, or `None` if it has to keep waiting.
    fn promote(&self, id: InstanceId) -> Option<InstanceState> {
        let dag = self.dag;
        let preds = dag.predecessors(id);

        if !preds.iter().all(|&p| self.states[p].is_terminal()) {
            return None;
        }

        if let Some(&failed) = preds.iter().find(|&&p| self.states[p].is_failed()) {
            let upstream = dag.instances()[failed].label.clone();
            debug!("{} blocked by {}", dag.instances()[id].label, upstream);
            return Some(InstanceState::Failed(FailureReason::BlockedByUpstreamFailure(upstream)));
        }

        if preds.iter().any(|&p| !self.states[p].is_satisfied()) {
            return Some(InstanceState::Skipped(SkipReason::Cancelled));
        }

        Some(InstanceState::Ready)
    }

    /// Checks a ready instance and either skips it or dispatches it.
    fn start(&mut self, id: InstanceId, tx: &mpsc::UnboundedSender<Completion>) {
        let dag = self.dag;
        let instance = &dag.instances()[id];

        let executed_upstream = dag
            .predecessors(id)
            .iter()
            .find(|&&p| self.executed[p])
            .map(|&p| dag.instances()[p].label.as_str());

        match self.checker.check(instance, executed_upstream) {
            Staleness::Fresh => {
                info!("{} is up to date", instance.label);
                self.states[id] = InstanceState::Skipped(SkipReason::UpToDate);
            }
            Staleness::Stale(reason) => {
                debug!("{} needs to run: {}", instance.label, reason);
                self.stale_reasons[id] = Some(reason.to_string());
                self.dispatch(id, tx);
            }
        }
    }

    fn dispatch(&mut self, id: InstanceId, tx: &mpsc::UnboundedSender<Completion>) {
        let dag = self.dag;
        let instance = &dag.instances()[id];
        let binding = instance.binding();

        let runnable = match instance.action.prepare(&binding) {
            Ok(runnable) => runnable,
            Err(reason) => {
                error!("{}: could not prepare action: {}", instance.label, reason);
                self.diagnostics[id] = vec![reason];
                self.fail(id, FailureReason::ActionError);
                return;
            }
        };

        self.attempts[id] += 1;
        if self.attempts[id] > 1 {
            info!("Retrying {} (attempt {})", instance.label, self.attempts[id]);
        } else {
            info!("Starting {}", instance.label);
        }

        self.timeline.record(instance.label.clone(), EventType::Started);
        self.states[id] = InstanceState::Running;
        self.running += 1;

        let mut handle = self.executor.submit(Job { binding, runnable });
        if let Some(canceller) = handle.take_canceller() {
            self.cancellers.insert(id, canceller);
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            let _ = tx.send(Completion { id, outcome });
        });
    }

    fn complete(&mut self, completion: Completion, tx: &mpsc::UnboundedSender<Completion>) {
        let Completion { id, outcome } = completion;
        let label = self.dag.instances()[id].label.clone();

        self.running = self.running.saturating_sub(1);
        self.cancellers.remove(&id);

        match outcome {
            JobOutcome::Succeeded => {
                info!("{} completed", label);
                self.timeline.record(label, EventType::Completed);
                self.states[id] = InstanceState::Succeeded;
                self.executed[id] = true;
            }
            JobOutcome::Failed { error, diagnostics } => {
                self.timeline.record(label.clone(), EventType::Failed);
                let mut lines = vec![error.to_string()];
                lines.extend(diagnostics);
                self.diagnostics[id] = lines;

                let retries = self.dag.instances()[id].retries;
                if !self.cancelling && self.attempts[id] <= retries {
                    warn!("{} (attempt {} of {})", error, self.attempts[id], retries + 1);
                    self.dispatch(id, tx);
                } else {
                    self.fail(id, FailureReason::from(&error));
                }
            }
            JobOutcome::Cancelled => {
                self.timeline.record(label, EventType::Cancelled);
                self.states[id] = InstanceState::Failed(FailureReason::Cancelled);
            }
            JobOutcome::Fatal(e) => {
                error!("Aborting run: {}", e);
                self.timeline.record(label, EventType::Failed);
                self.diagnostics[id] = vec![e.to_string()];
                self.states[id] = InstanceState::Failed(FailureReason::Cancelled);
                self.aborted.get_or_insert(e.to_string());
                self.begin_cancel(false);
            }
        }
    }

    fn fail(&mut self, id: InstanceId, reason: FailureReason) {
        error!("{} failed: {}", self.dag.instances()[id].label, reason);
        self.states[id] = InstanceState::Failed(reason);

        if self.fail_fast && !self.cancelling {
            warn!("Fail-fast: cancelling remaining work");
            self.begin_cancel(false);
        }
    }

    /// Stops dispatching, cancels running jobs and skips everything that
    /// has not started.
    fn begin_cancel(&mut self, external: bool) {
        self.cancelling = true;
        self.cancelled_externally |= external;

        for (_, canceller) in self.cancellers.drain() {
            let _ = canceller.send(());
        }

        for state in self.states.iter_mut() {
            if matches!(state, InstanceState::Pending | InstanceState::Ready) {
                *state = InstanceState::Skipped(SkipReason::Cancelled);
            }
        }
    }

    fn report(&self, started_at: chrono::DateTime<Local>) -> RunReport {
        let durations = self.timeline.durations();

        let instances = self
            .dag
            .topological_order()
            .iter()
            .map(|&id| {
                let instance = &self.dag.instances()[id];
                InstanceReport {
                    label: instance.label.clone(),
                    task: instance.task.clone(),
                    state: self.states[id].clone(),
                    attempts: self.attempts[id],
                    inputs: instance.inputs.clone(),
                    outputs: instance.outputs.clone(),
                    stale_reason: self.stale_reasons[id].clone(),
                    diagnostics: if self.states[id].is_failed() {
                        self.diagnostics[id].clone()
                    } else {
                        Vec::new()
                    },
                    duration_ms: durations.get(&instance.label).map(|&ms| ms as u64),
                }
            })
            .collect();

        let report = RunReport {
            started_at,
            finished_at: Local::now(),
            dry_run: self.executor.is_dry_run(),
            cancelled: self.cancelled_externally,
            aborted: self.aborted.clone(),
            instances,
        };

        let counts = report.counts();
        info!(
            "Run finished: {} executed, {} up to date, {} failed, {} cancelled",
            counts.succeeded, counts.up_to_date, counts.failed, counts.cancelled
        );
        report
    }
}
