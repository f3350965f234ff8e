//! Dependency graph between systems and its execution levels.
//!
//! An edge `dependency -> dependent` means the dependent system must not
//! start before the dependency finished in the same frame. The graph is kept
//! acyclic at all times: an edge that would close a cycle is rejected before
//! anything is mutated.
//!
//! Execution levels partition the nodes so that every node sits one level
//! after its deepest dependency (longest path from a root). All nodes of a
//! level are independent of each other and may run concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EcsError, EcsResult};
use crate::system::SystemId;

/// Ordered groups of systems; every system's dependencies live in earlier groups.
pub type ExecutionLevels = Arc<[Vec<SystemId>]>;

/// Notification fired synchronously whenever the graph changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphChange {
    SystemAdded(SystemId),
    DependencyAdded {
        dependent: SystemId,
        dependency: SystemId,
    },
    SystemRemoved(SystemId),
}

type Listener = Box<dyn Fn(&GraphChange) + Send + Sync>;

struct Node {
    label: String,
    dependencies: BTreeSet<SystemId>,
    dependents: BTreeSet<SystemId>,
}

impl Node {
    fn new(label: String) -> Self {
        Self {
            label,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
pub struct SystemDependencyGraph {
    nodes: BTreeMap<SystemId, Node>,
    cached_levels: Mutex<Option<ExecutionLevels>>,
    listeners: Vec<Listener>,
}

impl SystemDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to graph changes. Listeners run on the mutating thread.
    pub fn on_graph_changed(&mut self, listener: impl Fn(&GraphChange) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Register a node. Returns `false` (and fires nothing) if already present.
    pub fn add_system(&mut self, id: SystemId, label: impl Into<String>) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node::new(label.into()));
        self.changed(GraphChange::SystemAdded(id));
        true
    }

    /// Declare that `dependent` runs after `dependency`. Unknown nodes are
    /// registered on the fly.
    pub fn add_dependency(&mut self, dependent: SystemId, dependency: SystemId) -> EcsResult<()> {
        if dependent == dependency {
            return Err(EcsError::SelfDependency(dependent));
        }
        if let Some(path) = self.dependency_path(dependency, dependent) {
            return Err(EcsError::CyclicDependency {
                dependent,
                dependency,
                path: path.iter().map(|id| self.label(*id)).collect(),
            });
        }

        self.add_system(dependent, default_label(dependent));
        self.add_system(dependency, default_label(dependency));

        if !self.insert_edge(dependent, dependency) {
            return Ok(());
        }
        self.changed(GraphChange::DependencyAdded {
            dependent,
            dependency,
        });
        Ok(())
    }

    /// Remove a node. Every dependent of the removed node inherits its
    /// dependencies so the remaining ordering is preserved.
    pub fn remove_system(&mut self, id: SystemId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for dependent in &node.dependents {
            if let Some(n) = self.nodes.get_mut(dependent) {
                n.dependencies.remove(&id);
            }
        }
        for dependency in &node.dependencies {
            if let Some(n) = self.nodes.get_mut(dependency) {
                n.dependents.remove(&id);
            }
        }
        // A path dependent -> id -> dependency existed, so these edges cannot
        // close a cycle.
        for &dependent in &node.dependents {
            for &dependency in &node.dependencies {
                self.insert_edge(dependent, dependency);
            }
        }
        self.changed(GraphChange::SystemRemoved(id));
        true
    }

    pub fn contains(&self, id: SystemId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `dependent` directly depends on `dependency`.
    pub fn has_dependency(&self, dependent: SystemId, dependency: SystemId) -> bool {
        self.nodes
            .get(&dependent)
            .is_some_and(|n| n.dependencies.contains(&dependency))
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, id: SystemId) -> Vec<SystemId> {
        self.nodes
            .get(&id)
            .map(|n| n.dependencies.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, id: SystemId) -> Vec<SystemId> {
        self.nodes
            .get(&id)
            .map(|n| n.dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Execution levels, computed on first use after a change and cached.
    pub fn execution_levels(&self) -> ExecutionLevels {
        let mut cache = self.cached_levels.lock();
        if let Some(levels) = cache.as_ref() {
            return levels.clone();
        }
        let levels: ExecutionLevels = self.compute_levels().into();
        *cache = Some(levels.clone());
        levels
    }

    /// Human-readable edge listing, one block per system.
    pub fn dependency_graph_info(&self) -> String {
        let mut out = String::new();
        for node in self.nodes.values() {
            let _ = writeln!(out, "System: {}", node.label);
            for dep in &node.dependencies {
                let _ = writeln!(out, "  -> {}", self.label(*dep));
            }
        }
        out
    }

    fn label(&self, id: SystemId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.label.clone())
            .unwrap_or_else(|| default_label(id))
    }

    fn insert_edge(&mut self, dependent: SystemId, dependency: SystemId) -> bool {
        let inserted = self
            .nodes
            .get_mut(&dependent)
            .is_some_and(|n| n.dependencies.insert(dependency));
        if inserted {
            if let Some(n) = self.nodes.get_mut(&dependency) {
                n.dependents.insert(dependent);
            }
        }
        inserted
    }

    /// Breadth-first search along dependency edges. Returns the path
    /// `from, .., to` if `from` transitively depends on `to`.
    fn dependency_path(&self, from: SystemId, to: SystemId) -> Option<Vec<SystemId>> {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return None;
        }
        let mut parent: HashMap<SystemId, SystemId> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to];
                let mut step = to;
                while let Some(&prev) = parent.get(&step) {
                    path.push(prev);
                    step = prev;
                }
                path.reverse();
                return Some(path);
            }
            for &next in &self.nodes[&current].dependencies {
                if next != from && !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn compute_levels(&self) -> Vec<Vec<SystemId>> {
        let mut pending: BTreeMap<SystemId, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (*id, n.dependencies.len()))
            .collect();

        let mut ready: Vec<SystemId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut levels = Vec::new();

        while !ready.is_empty() {
            let mut next = Vec::new();
            for id in &ready {
                pending.remove(id);
                for dependent in &self.nodes[id].dependents {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort_unstable();
            levels.push(std::mem::replace(&mut ready, next));
        }

        if !pending.is_empty() {
            tracing::error!(
                "dependency graph contains a cycle; {} systems left unscheduled",
                pending.len()
            );
        }
        levels
    }

    fn changed(&mut self, change: GraphChange) {
        *self.cached_levels.get_mut() = None;
        tracing::trace!(?change, "system graph changed");
        for listener in &self.listeners {
            listener(&change);
        }
    }
}

fn default_label(id: SystemId) -> String {
    format!("system{}", id)
}
