// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::traits::ComputeFunction;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable snapshot of the registry handed to an isolation context at creation.
///
/// A context never sees later registrations; the pool replaces contexts instead.
#[derive(Clone, Default)]
pub struct FunctionTable(HashMap<String, Arc<dyn ComputeFunction>>);

impl FunctionTable {
    pub fn get(&self, name: &str) -> Option<Arc<dyn ComputeFunction>> {
        self.0.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Function names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FunctionTable").field(&self.names()).finish()
    }
}

/// Mutable name -> function registry owned by the pool.
///
/// Every change bumps the generation so contexts built from an older snapshot can be told apart.
#[derive(Default)]
pub(crate) struct FunctionRegistry {
    entries: HashMap<String, Arc<dyn ComputeFunction>>,
    generation: u64,
}

impl FunctionRegistry {
    /// Insert or replace a function.
    pub fn register(&mut self, name: String, function: Arc<dyn ComputeFunction>) {
        self.entries.insert(name, function);
        self.generation += 1;
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.generation += 1;
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> Arc<FunctionTable> {
        Arc::new(FunctionTable(self.entries.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::from_fn;
    use serde_json::Value;

    fn identity() -> Arc<dyn ComputeFunction> {
        Arc::new(from_fn(|x: Value| Ok(x)))
    }

    #[test]
    fn test_register_bumps_generation() {
        let mut registry = FunctionRegistry::default();
        assert_eq!(registry.generation(), 0);

        registry.register("a".into(), identity());
        registry.register("a".into(), identity());
        assert_eq!(registry.generation(), 2);
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_unregister_unknown_keeps_generation() {
        let mut registry = FunctionRegistry::default();
        registry.register("a".into(), identity());

        assert!(!registry.unregister("b"));
        assert_eq!(registry.generation(), 1);
        assert!(registry.unregister("a"));
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let mut registry = FunctionRegistry::default();
        registry.register("b".into(), identity());
        registry.register("a".into(), identity());
        let snapshot = registry.snapshot();

        registry.register("c".into(), identity());

        assert_eq!(snapshot.names(), vec!["a", "b"]);
        assert!(!snapshot.contains("c"));
        assert_eq!(registry.snapshot().len(), 3);
    }
}
