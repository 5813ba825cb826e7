//! Dependency graph over built [`Instance`]s (spec §4.3). Grounded on
//! `paritytech-cargo-unleash`'s `packages_to_release`: a `petgraph::Graph` is
//! built fresh from the current node set, edges point from a dependency to
//! its dependent, and `petgraph::algo::toposort` does the ordering and cycle
//! detection in one pass.

use std::collections::HashMap;

use petgraph::graph::DiGraph;
use thiserror::Error;

use crate::errors::ErrorClass;
use crate::model::Instance;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("component `{0}` declared more than once")]
    DuplicateComponentID(String),

    #[error("component `{0}` depends on unknown component `{1}`")]
    UnknownComponentID(String, String),

    #[error("cyclic dependency detected at component `{0}`")]
    CyclicDependency(String),
}

impl GraphError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

/// Holds the instances of a single reconcile pass keyed by component ID.
/// Edges are not maintained incrementally; they are rebuilt from
/// `dependencies()` each time [`DependencyGraph::topological_sort`] runs,
/// since the graph is populated once per pass and never mutated concurrently
/// with a sort (spec §5).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    instances: HashMap<String, Instance>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph {
            instances: HashMap::new(),
        }
    }

    pub fn insert(&mut self, instance: Instance) -> Result<(), GraphError> {
        let id = instance.id().to_string();
        if self.instances.contains_key(&id) {
            return Err(GraphError::DuplicateComponentID(id));
        }
        self.instances.insert(id, instance);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<Instance> {
        self.instances.remove(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    /// Returns instances ordered so that for every declared dependency edge
    /// `a -> b`, `b` (the dependency) precedes `a` (the dependent) in the
    /// result. Raises `UnknownComponentID` before handing anything to
    /// `petgraph`, since `toposort` silently ignores edges whose endpoints
    /// aren't registered as nodes.
    pub fn topological_sort(&self) -> Result<Vec<Instance>, GraphError> {
        for instance in self.instances.values() {
            for dep in instance.dependencies() {
                if !self.instances.contains_key(dep) {
                    return Err(GraphError::UnknownComponentID(
                        instance.id().to_string(),
                        dep.clone(),
                    ));
                }
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut index_of = HashMap::with_capacity(self.instances.len());
        for id in self.instances.keys() {
            index_of.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for instance in self.instances.values() {
            let dependent = index_of[instance.id()];
            for dep in instance.dependencies() {
                graph.add_edge(index_of[dep.as_str()], dependent, ());
            }
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| GraphError::CyclicDependency(graph[cycle.node_id()].to_string()))?;

        Ok(order
            .into_iter()
            .map(|idx| self.instances[graph[idx]].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ManifestInstance;
    use serde_json::json;

    fn manifest(id: &str, deps: &[&str]) -> Instance {
        Instance::Manifest(ManifestInstance {
            id: id.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            content: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": id}}),
            metadata: Default::default(),
        })
    }

    #[test]
    fn orders_dependency_before_dependent() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("web", &["db"])).unwrap();
        graph.insert(manifest("db", &[])).unwrap();
        let sorted = graph.topological_sort().unwrap();
        let positions: Vec<&str> = sorted.iter().map(Instance::id).collect();
        let db_pos = positions.iter().position(|id| *id == "db").unwrap();
        let web_pos = positions.iter().position(|id| *id == "web").unwrap();
        assert!(db_pos < web_pos);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &[])).unwrap();
        let err = graph.insert(manifest("a", &[])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateComponentID(id) if id == "a"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &["missing"])).unwrap();
        let err = graph.topological_sort().unwrap_err();
        assert!(matches!(err, GraphError::UnknownComponentID(a, dep) if a == "a" && dep == "missing"));
    }

    #[test]
    fn cycle_rejected() {
        let mut graph = DependencyGraph::new();
        graph.insert(manifest("a", &["b"])).unwrap();
        graph.insert(manifest("b", &["a"])).unwrap();
        assert!(matches!(
            graph.topological_sort(),
            Err(GraphError::CyclicDependency(_))
        ));
    }
}
