//! Dependency Graph Builder
//!
//! Expands task definitions into concrete task instances by matching file
//! patterns against the filesystem snapshot and against the outputs of
//! other instances, then links each instance to the producers of its
//! inputs. Edges are never declared per instance; they follow from the
//! paths alone (plus task-level `after` ordering).
//!
//! The result is checked for cycles and ambiguous outputs before anything
//! is scheduled.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use super::model::{Aggregation, InputSource, ResourceHints, TaskDefinition};
use super::patterns::{path_captures, Captures};
use super::registry::TaskRegistry;
use super::snapshot::Snapshot;
use crate::error::DefinitionError;
use crate::execution::action::{Action, Binding};

/// Index of an instance within its [`Dag`].
pub type InstanceId = usize;

/// One concrete, file-bound execution of a task definition.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub id: InstanceId,
    /// Name of the task definition
    pub task: String,
    /// Unique label, e.g. `run_mapping[s1]`
    pub label: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Instances that must finish first (sorted, deduplicated)
    pub predecessors: Vec<InstanceId>,
    pub hints: ResourceHints,
    pub action: Arc<dyn Action>,
    pub retries: u32,
}

impl TaskInstance {
    /// The binding handed to the instance's action.
    pub fn binding(&self) -> Binding {
        Binding {
            label: self.label.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            hints: self.hints.clone(),
        }
    }
}

/// Directed acyclic graph of task instances.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    instances: Vec<TaskInstance>,
    successors: Vec<Vec<InstanceId>>,
    order: Vec<InstanceId>,
}

impl Dag {
    /// Builds a DAG from instances whose `predecessors` are already set.
    ///
    /// Fails with [`DefinitionError::CyclicDependency`] if the edges form a
    /// cycle.
    pub fn from_instances(instances: Vec<TaskInstance>) -> Result<Self, DefinitionError> {
        let mut successors = vec![Vec::new(); instances.len()];
        for instance in &instances {
            for &pred in &instance.predecessors {
                successors[pred].push(instance.id);
            }
        }

        let mut dag = Self {
            instances,
            successors,
            order: Vec::new(),
        };

        dag.detect_cycles()?;
        dag.order = dag.kahn_order()?;

        debug!(
            "Topological order: {:?}",
            dag.order
                .iter()
                .map(|&id| dag.instances[id].label.as_str())
                .collect::<Vec<_>>()
        );

        Ok(dag)
    }

    pub fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    pub fn get(&self, id: InstanceId) -> Option<&TaskInstance> {
        self.instances.get(id)
    }

    pub fn predecessors(&self, id: InstanceId) -> &[InstanceId] {
        &self.instances[id].predecessors
    }

    pub fn successors(&self, id: InstanceId) -> &[InstanceId] {
        &self.successors[id]
    }

    /// Instance ids with every predecessor before its dependents; ties are
    /// broken by id, i.e. by registration order.
    pub fn topological_order(&self) -> &[InstanceId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Ids of the instances of one task.
    pub fn instances_of(&self, task: &str) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|i| i.task == task)
            .map(|i| i.id)
            .collect()
    }

    /// Looks up an instance by label.
    pub fn find(&self, label: &str) -> Option<&TaskInstance> {
        self.instances.iter().find(|i| i.label == label)
    }

    /// Every instance the given one transitively depends on.
    pub fn ancestors(&self, id: InstanceId) -> BTreeSet<InstanceId> {
        self.reachable(id, |dag, n| dag.predecessors(n))
    }

    /// Every instance that transitively depends on the given one.
    pub fn descendants(&self, id: InstanceId) -> BTreeSet<InstanceId> {
        self.reachable(id, |dag, n| dag.successors(n))
    }

    fn reachable<'a, F>(&'a self, start: InstanceId, next: F) -> BTreeSet<InstanceId>
    where
        F: Fn(&'a Dag, InstanceId) -> &'a [InstanceId],
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<InstanceId> = next(self, start).iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                queue.extend(next(self, current).iter().copied());
            }
        }

        seen
    }

    /// Restricts the graph to the instances of the given tasks and all of
    /// their ancestors. Ids are renumbered; relative order is preserved.
    pub fn select_targets(&self, targets: &[&str]) -> Result<Dag, DefinitionError> {
        let mut keep = BTreeSet::new();

        for &target in targets {
            if !self.instances.iter().any(|i| i.task == target) {
                return Err(DefinitionError::UnknownTask {
                    task: "<target>".to_string(),
                    reference: target.to_string(),
                });
            }
            for id in self.instances_of(target) {
                keep.insert(id);
                keep.extend(self.ancestors(id));
            }
        }

        let renumber: HashMap<InstanceId, InstanceId> = keep
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();

        let instances = keep
            .iter()
            .map(|&old| {
                let mut instance = self.instances[old].clone();
                instance.id = renumber[&old];
                instance.predecessors = instance
                    .predecessors
                    .iter()
                    .filter_map(|p| renumber.get(p).copied())
                    .collect();
                instance
            })
            .collect();

        info!(
            "Selected {} of {} instances for targets {:?}",
            keep.len(),
            self.instances.len(),
            targets
        );

        Dag::from_instances(instances)
    }

    /// Depth-first search with three colours; a grey node reached again is
    /// on the current stack and closes a cycle.
    fn detect_cycles(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        fn visit(
            dag: &Dag,
            id: InstanceId,
            colours: &mut [Colour],
            stack: &mut Vec<InstanceId>,
        ) -> Result<(), DefinitionError> {
            colours[id] = Colour::Grey;
            stack.push(id);

            for &next in dag.successors(id) {
                match colours[next] {
                    Colour::Grey => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| dag.instances[n].label.clone())
                            .collect();
                        cycle.push(dag.instances[next].label.clone());
                        return Err(DefinitionError::CyclicDependency { cycle });
                    }
                    Colour::White => visit(dag, next, colours, stack)?,
                    Colour::Black => {}
                }
            }

            stack.pop();
            colours[id] = Colour::Black;
            Ok(())
        }

        let mut colours = vec![Colour::White; self.instances.len()];
        let mut stack = Vec::new();

        for id in 0..self.instances.len() {
            if colours[id] == Colour::White {
                visit(self, id, &mut colours, &mut stack)?;
            }
        }

        Ok(())
    }

    /// Kahn's algorithm, always releasing the lowest ready id first.
    fn kahn_order(&self) -> Result<Vec<InstanceId>, DefinitionError> {
        let mut in_degree: Vec<usize> = self
            .instances
            .iter()
            .map(|i| i.predecessors.len())
            .collect();

        let mut ready: BTreeSet<InstanceId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.instances.len());

        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &self.successors[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.instances.len() {
            return Err(DefinitionError::CyclicDependency {
                cycle: self
                    .instances
                    .iter()
                    .filter(|i| !order.contains(&i.id))
                    .map(|i| i.label.clone())
                    .collect(),
            });
        }

        Ok(order)
    }
}

/// Builds the instance graph from a registry and a snapshot.
pub struct GraphBuilder<'a> {
    registry: &'a TaskRegistry,
    snapshot: &'a Snapshot,
}

/// Mutable state while expanding definitions.
#[derive(Default)]
struct Expansion {
    instances: Vec<TaskInstance>,
    producers: HashMap<PathBuf, InstanceId>,
    by_task: HashMap<String, Vec<InstanceId>>,
    labels: HashSet<String>,
    resolved: HashSet<String>,
    stack: Vec<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a TaskRegistry, snapshot: &'a Snapshot) -> Self {
        Self { registry, snapshot }
    }

    /// Expands every definition and links the resulting instances.
    ///
    /// Definitions are visited in registration order; upstream tasks named
    /// by a definition are resolved first.
    pub fn build(&self) -> Result<Dag, DefinitionError> {
        let mut state = Expansion::default();

        for definition in self.registry.all() {
            self.resolve(definition, &mut state)?;
        }

        self.link(&mut state);

        let dag = Dag::from_instances(state.instances)?;
        info!(
            "Built task graph: {} tasks, {} instances",
            self.registry.len(),
            dag.len()
        );
        Ok(dag)
    }

    fn resolve(&self, definition: &TaskDefinition, state: &mut Expansion) -> Result<(), DefinitionError> {
        let name = definition.name();

        if state.resolved.contains(name) {
            return Ok(());
        }

        if let Some(start) = state.stack.iter().position(|n| n == name) {
            let mut cycle = state.stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(DefinitionError::CyclicDependency { cycle });
        }

        state.stack.push(name.to_string());

        for upstream in definition.upstream_names() {
            let upstream_def = self.registry.get(upstream).ok_or_else(|| DefinitionError::UnknownTask {
                task: name.to_string(),
                reference: upstream.to_string(),
            })?;
            self.resolve(upstream_def, state)?;
        }

        self.expand(definition, state)?;

        state.stack.pop();
        state.resolved.insert(name.to_string());
        Ok(())
    }

    /// Candidate input paths with their captures, sorted by path.
    fn candidates(&self, definition: &TaskDefinition, state: &Expansion) -> Vec<(PathBuf, Captures)> {
        match definition.input() {
            InputSource::Files(pattern) => {
                let paths: BTreeSet<&Path> = self
                    .snapshot
                    .paths()
                    .chain(state.producers.keys().map(PathBuf::as_path))
                    .collect();

                paths
                    .into_iter()
                    .filter_map(|p| pattern.matches(p).map(|caps| (p.to_path_buf(), caps)))
                    .collect()
            }
            InputSource::Tasks { upstream, pattern } => {
                let paths: BTreeSet<PathBuf> = upstream
                    .iter()
                    .flat_map(|task| state.by_task.get(task).cloned().unwrap_or_default())
                    .flat_map(|id| state.instances[id].outputs.clone())
                    .collect();

                paths
                    .into_iter()
                    .filter_map(|p| {
                        let caps = match pattern {
                            Some(pattern) => pattern.matches(&p)?,
                            None => path_captures(&p),
                        };
                        Some((p, caps))
                    })
                    .collect()
            }
            InputSource::None => Vec::new(),
        }
    }

    fn expand(&self, definition: &TaskDefinition, state: &mut Expansion) -> Result<(), DefinitionError> {
        let name = definition.name();
        let rule = definition.output();

        if matches!(definition.input(), InputSource::None) {
            let outputs = rule.derive_outputs(name, Path::new(""), &Captures::new())?;
            self.add_instance(definition, name.to_string(), Vec::new(), outputs, state)?;
            return Ok(());
        }

        let matched = self.candidates(definition, state);
        if matched.is_empty() {
            warn!("Task '{}' matched no inputs", name);
            return Ok(());
        }

        match definition.aggregation() {
            Aggregation::OneToOne => {
                for (path, caps) in matched {
                    let outputs = rule.derive_outputs(name, &path, &caps)?;
                    let label = format!("{}[{}]", name, instance_key(&caps));
                    self.add_instance(definition, label, vec![path], outputs, state)?;
                }
            }
            Aggregation::ManyToOne => {
                let (first_path, first_caps) = &matched[0];
                let outputs = rule.derive_outputs(name, first_path, first_caps)?;
                let inputs = matched.into_iter().map(|(p, _)| p).collect();
                self.add_instance(definition, name.to_string(), inputs, outputs, state)?;
            }
            Aggregation::OneToMany => {
                for (path, caps) in matched {
                    let key = instance_key(&caps);
                    for output in rule.derive_outputs(name, &path, &caps)? {
                        let file = output
                            .file_name()
                            .map(|f| f.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let label = format!("{}[{}:{}]", name, key, file);
                        self.add_instance(definition, label, vec![path.clone()], vec![output], state)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn add_instance(
        &self,
        definition: &TaskDefinition,
        label: String,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        state: &mut Expansion,
    ) -> Result<(), DefinitionError> {
        let id = state.instances.len();
        let label = unique_label(label, &state.labels);

        for output in &outputs {
            if let Some(&existing) = state.producers.get(output) {
                return Err(DefinitionError::AmbiguousOutput {
                    path: output.clone(),
                    first: state.instances[existing].label.clone(),
                    second: label,
                });
            }
        }

        for output in &outputs {
            state.producers.insert(output.clone(), id);
        }

        debug!("Instance {}: {:?} -> {:?}", label, inputs, outputs);

        state.labels.insert(label.clone());
        state
            .by_task
            .entry(definition.name().to_string())
            .or_default()
            .push(id);

        state.instances.push(TaskInstance {
            id,
            task: definition.name().to_string(),
            label,
            inputs,
            outputs,
            predecessors: Vec::new(),
            hints: definition.hints().clone(),
            action: Arc::clone(definition.action()),
            retries: definition.retries(),
        });

        Ok(())
    }

    /// Binds every input to the instance producing it, and adds task-level
    /// `after` edges.
    fn link(&self, state: &mut Expansion) {
        let mut edges = 0;

        for id in 0..state.instances.len() {
            let mut preds: BTreeSet<InstanceId> = state.instances[id]
                .inputs
                .iter()
                .filter_map(|input| state.producers.get(input).copied())
                .collect();

            let task = state.instances[id].task.clone();
            if let Some(definition) = self.registry.get(&task) {
                for after in definition.after() {
                    preds.extend(state.by_task.get(after).into_iter().flatten().copied());
                }
            }

            edges += preds.len();
            state.instances[id].predecessors = preds.into_iter().collect();
        }

        debug!("Linked {} dependency edges", edges);
    }
}

/// Short key identifying an instance within its task.
fn instance_key(captures: &Captures) -> String {
    captures
        .get("1")
        .or_else(|| captures.get("stem"))
        .cloned()
        .unwrap_or_default()
}

fn unique_label(label: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&label) {
        return label;
    }
    (2..)
        .map(|n| format!("{}#{}", label, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(label)
}
