use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

use super::metadata::ExtensionDescriptor;
use crate::error::{EngineError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Dependency graph over a snapshot of registered descriptors, indexed by
/// registration order.
pub struct Resolver<'a> {
    descriptors: &'a [Arc<ExtensionDescriptor>],
    index: HashMap<&'a str, usize>,
    reverse: Vec<Vec<usize>>,
}

impl<'a> Resolver<'a> {
    pub fn new(descriptors: &'a [Arc<ExtensionDescriptor>]) -> Self {
        let index: HashMap<&str, usize> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.as_str(), i))
            .collect();

        let mut reverse = vec![Vec::new(); descriptors.len()];
        for (i, descriptor) in descriptors.iter().enumerate() {
            for dep in &descriptor.dependencies {
                if let Some(&d) = index.get(dep.as_str()) {
                    reverse[d].push(i);
                }
            }
        }

        Self {
            descriptors,
            index,
            reverse,
        }
    }

    /// Execution order for `requested` and everything it needs: each
    /// dependency before its dependents, ties broken by registration order.
    ///
    /// Fails before anything runs on an unknown name or a cycle.
    pub fn order<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        let mut marks = vec![Mark::White; self.descriptors.len()];
        let mut stack = Vec::new();
        for name in requested {
            let i = self.lookup(name.as_ref(), None)?;
            self.visit(i, &mut marks, &mut stack)?;
        }

        // Kahn over the closure; the heap always releases the earliest registered ready node
        let closure: Vec<usize> = (0..marks.len())
            .filter(|&i| marks[i] == Mark::Black)
            .collect();
        let mut pending: HashMap<usize, usize> = closure
            .iter()
            .map(|&i| (i, self.descriptors[i].dependencies.len()))
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(closure.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.descriptors[i].name.clone());
            for &dependent in &self.reverse[i] {
                if let Some(n) = pending.get_mut(&dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }
        Ok(order)
    }

    fn visit(&self, i: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Result<()> {
        match marks[i] {
            Mark::Black => return Ok(()),
            Mark::Gray => {
                let start = stack.iter().position(|&s| s == i).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|&s| self.descriptors[s].name.clone())
                    .collect();
                cycle.push(self.descriptors[i].name.clone());
                return Err(EngineError::CyclicDependency { cycle });
            }
            Mark::White => {}
        }

        marks[i] = Mark::Gray;
        stack.push(i);
        let descriptor = &self.descriptors[i];
        for dep in &descriptor.dependencies {
            let d = self.lookup(dep, Some(&descriptor.name))?;
            self.visit(d, marks, stack)?;
        }
        stack.pop();
        marks[i] = Mark::Black;
        Ok(())
    }

    fn lookup(&self, name: &str, required_by: Option<&str>) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownExtension {
                name: name.to_string(),
                required_by: required_by.map(str::to_string),
            })
    }

    /// Every extension that depends on `name`, directly or transitively, in
    /// registration order. `name` itself is not included.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let Some(&root) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut queue = vec![root];
        while let Some(i) = queue.pop() {
            for &dependent in &self.reverse[i] {
                if dependent != root && seen.insert(dependent) {
                    queue.push(dependent);
                }
            }
        }
        seen.into_iter()
            .map(|i| self.descriptors[i].name.clone())
            .collect()
    }

    /// Direct dependents of `name`.
    pub fn direct_dependents(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|&i| {
                self.reverse[i]
                    .iter()
                    .map(|&d| self.descriptors[d].name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Vec<Arc<ExtensionDescriptor>> {
        edges.iter()
            .map(|(name, deps)| {
                let d = deps
                    .iter()
                    .fold(ExtensionDescriptor::new(*name), |d, dep| d.depends_on(*dep));
                Arc::new(d)
            })
            .collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let order = Resolver::new(&g).order(&["c"]).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let g = graph(&[("z", &[]), ("y", &[]), ("x", &["y", "z"]), ("w", &[])]);
        let order = Resolver::new(&g).order(&["w", "x"]).unwrap();
        assert_eq!(order, vec!["z", "y", "x", "w"]);
    }

    #[test]
    fn test_cycle_path_is_reported() {
        let g = graph(&[("x", &["y"]), ("y", &["z"]), ("z", &["y"])]);
        match Resolver::new(&g).order(&["x"]).unwrap_err() {
            EngineError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["y", "z", "y"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("x", &["x"])]);
        assert!(matches!(
            Resolver::new(&g).order(&["x"]),
            Err(EngineError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency_names_requirer() {
        let g = graph(&[("x", &["ghost"])]);
        match Resolver::new(&g).order(&["x"]).unwrap_err() {
            EngineError::UnknownExtension { name, required_by } => {
                assert_eq!(name, "ghost");
                assert_eq!(required_by.as_deref(), Some("x"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let resolver = Resolver::new(&g);
        assert_eq!(resolver.dependents("a"), vec!["b", "c"]);
        assert_eq!(resolver.direct_dependents("a"), vec!["b"]);
        assert!(resolver.dependents("d").is_empty());
        assert!(resolver.dependents("missing").is_empty());
    }
}
