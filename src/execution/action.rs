//! Task Actions
//!
//! An action turns a bound task instance (its inputs, outputs and resource
//! hints) into something the executor can run. The engine never looks
//! inside the result: command strings are only built here.
//!
//! # Placeholder Substitution
//!
//! [`ShellAction`] supports the following placeholders:
//! - `{input}` / `{inputs}` - Space-separated input files
//! - `{output}` / `{outputs}` - Space-separated output files
//! - `{threads}` - Thread count from the resource hints
//! - `{queue}` - Queue class from the resource hints (empty if unset)

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::workflow::ResourceHints;

/// Everything an action may use to build its job.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Human-readable instance label, e.g. `run_mapping[s1]`
    pub label: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub hints: ResourceHints,
}

impl Binding {
    /// First input, or an empty string.
    pub fn input(&self) -> String {
        self.inputs
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    /// First output, or an empty string.
    pub fn output(&self) -> String {
        self.outputs
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    pub fn inputs_joined(&self) -> String {
        join_paths(&self.inputs)
    }

    pub fn outputs_joined(&self) -> String {
        join_paths(&self.outputs)
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-process callable.
pub type Callable = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// What the executor actually runs.
#[derive(Clone)]
pub enum Runnable {
    /// Shell command, run with `sh -c` or submitted to the queue
    Command(String),
    /// Rust closure, always run inside the engine process
    Callable(Callable),
    /// Nothing to do
    Noop,
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            Self::Callable(_) => f.write_str("Callable(<fn>)"),
            Self::Noop => f.write_str("Noop"),
        }
    }
}

/// A job action supplied by the workflow author.
pub trait Action: Send + Sync + fmt::Debug {
    /// Builds the runnable for one bound instance.
    fn prepare(&self, binding: &Binding) -> Result<Runnable, String>;

    /// True if the action never does any work.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Command template with `{input}`/`{output}` style placeholders.
#[derive(Debug, Clone)]
pub struct ShellAction {
    template: String,
}

impl ShellAction {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into().trim().to_string(),
        }
    }
}

impl Action for ShellAction {
    fn prepare(&self, binding: &Binding) -> Result<Runnable, String> {
        if self.template.is_empty() {
            return Err(format!("'{}' has an empty command", binding.label));
        }

        let inputs = binding.inputs_joined();
        let outputs = binding.outputs_joined();

        let command = self
            .template
            .replace("{inputs}", &inputs)
            .replace("{outputs}", &outputs)
            .replace("{input}", &binding.input())
            .replace("{output}", &binding.output())
            .replace("{threads}", &binding.hints.threads.to_string())
            .replace("{queue}", binding.hints.queue.as_deref().unwrap_or(""));

        Ok(Runnable::Command(command))
    }
}

type CommandBuilder = Arc<dyn Fn(&Binding) -> Result<String, String> + Send + Sync>;

/// Action whose command is assembled by a closure.
#[derive(Clone)]
pub struct CommandAction {
    build: CommandBuilder,
}

impl CommandAction {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&Binding) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
        }
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandAction(<fn>)")
    }
}

impl Action for CommandAction {
    fn prepare(&self, binding: &Binding) -> Result<Runnable, String> {
        (self.build)(binding).map(Runnable::Command)
    }
}

type BoundCallable = Arc<dyn Fn(&Binding) -> Result<(), String> + Send + Sync>;

/// Action executed in-process.
#[derive(Clone)]
pub struct FnAction {
    run: BoundCallable,
}

impl FnAction {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&Binding) -> Result<(), String> + Send + Sync + 'static,
    {
        Self { run: Arc::new(run) }
    }
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnAction(<fn>)")
    }
}

impl Action for FnAction {
    fn prepare(&self, binding: &Binding) -> Result<Runnable, String> {
        let run = Arc::clone(&self.run);
        let binding = binding.clone();
        Ok(Runnable::Callable(Arc::new(move || run(&binding))))
    }
}

/// Action that does nothing; used by targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

impl Action for NoopAction {
    fn prepare(&self, _binding: &Binding) -> Result<Runnable, String> {
        Ok(Runnable::Noop)
    }

    fn is_noop(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> Binding {
        Binding {
            label: "t[s1]".into(),
            inputs: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            outputs: vec![PathBuf::from("out/c.txt")],
            hints: ResourceHints {
                threads: 4,
                queue: Some("gpu".into()),
                ..ResourceHints::default()
            },
        }
    }

    #[test]
    fn test_shell_action_substitution() {
        let action = ShellAction::new("cat {inputs} > {output} # {threads} {queue} {input}");
        match action.prepare(&binding()).unwrap() {
            Runnable::Command(cmd) => {
                assert_eq!(cmd, "cat a.txt b.txt > out/c.txt # 4 gpu a.txt");
            }
            other => panic!("unexpected runnable {:?}", other),
        }
    }

    #[test]
    fn test_shell_action_empty_command() {
        let action = ShellAction::new("   ");
        assert!(action.prepare(&binding()).is_err());
    }

    #[test]
    fn test_command_action() {
        let action = CommandAction::new(|b| Ok(format!("wc -l {}", b.inputs_joined())));
        match action.prepare(&binding()).unwrap() {
            Runnable::Command(cmd) => assert_eq!(cmd, "wc -l a.txt b.txt"),
            other => panic!("unexpected runnable {:?}", other),
        }
    }

    #[test]
    fn test_fn_action_receives_binding() {
        let action = FnAction::new(|b| {
            if b.outputs.len() == 1 {
                Ok(())
            } else {
                Err("expected one output".into())
            }
        });

        match action.prepare(&binding()).unwrap() {
            Runnable::Callable(f) => assert!(f().is_ok()),
            other => panic!("unexpected runnable {:?}", other),
        }
    }

    #[test]
    fn test_noop_action() {
        assert!(NoopAction.is_noop());
        assert!(!ShellAction::new("true").is_noop());
        assert!(matches!(NoopAction.prepare(&binding()).unwrap(), Runnable::Noop));
    }

    #[test]
    fn test_binding_empty_paths() {
        let b = Binding {
            label: "x".into(),
            inputs: vec![],
            outputs: vec![],
            hints: ResourceHints::default(),
        };
        assert_eq!(b.input(), "");
        assert_eq!(b.outputs_joined(), "");
    }
}
