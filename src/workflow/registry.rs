//! Task Registry
//!
//! Holds the declared task definitions in registration order. Order only
//! matters for deterministic tie-breaking when the graph is built and
//! scheduled.

use std::collections::HashMap;

use log::debug;

use super::model::TaskDefinition;
use crate::error::DefinitionError;

/// Ordered set of task definitions with unique names.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    definitions: Vec<TaskDefinition>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition.
    ///
    /// Fails with [`DefinitionError::DuplicateTaskName`] if a task with the
    /// same name is already registered.
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), DefinitionError> {
        if self.index.contains_key(definition.name()) {
            return Err(DefinitionError::DuplicateTaskName(
                definition.name().to_string(),
            ));
        }

        debug!("Registered task '{}'", definition.name());
        self.index
            .insert(definition.name().to_string(), self.definitions.len());
        self.definitions.push(definition);
        Ok(())
    }

    /// All definitions, in registration order.
    pub fn all(&self) -> &[TaskDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.index.get(name).map(|&i| &self.definitions[i])
    }

    /// Position of a task in registration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Task names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> TaskDefinition {
        TaskDefinition::builder(name).build().unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register(def("a")).unwrap();
        registry.register(def("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert_eq!(registry.get("b").unwrap().name(), "b");
        assert_eq!(registry.position("b"), Some(1));
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register(def("a")).unwrap();

        let err = registry.register(def("a")).unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateTaskName("a".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_all_preserves_registration_order() {
        let mut registry = TaskRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(def(name)).unwrap();
        }

        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.all()[1].name(), "alpha");
    }

    #[test]
    fn test_empty_registry() {
        let registry = TaskRegistry::default();
        assert!(registry.is_empty());
    }
}
