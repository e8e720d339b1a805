//! Module prerequisite graph.
//!
//! Edges point from a module to the modules it requires. The graph must stay acyclic:
//! every change to a module's prerequisite set is checked with a depth-first search
//! before it is written.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("a module cannot be its own prerequisite")]
    SelfReference,
    #[error("circular prerequisite: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct PrerequisiteGraph {
    requires: HashMap<String, BTreeSet<String>>,
}

impl PrerequisiteGraph {
    pub fn from_edges<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut graph = Self::default();
        for (module, prerequisite) in edges {
            graph
                .requires
                .entry(module.into())
                .or_default()
                .insert(prerequisite.into());
        }
        graph
    }

    pub fn prerequisites_of(&self, module: &str) -> impl Iterator<Item = &str> {
        self.requires
            .get(module)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn replace(&mut self, module: &str, prerequisites: &[String]) {
        let set: BTreeSet<String> = prerequisites.iter().cloned().collect();
        if set.is_empty() {
            self.requires.remove(module);
        } else {
            self.requires.insert(module.to_string(), set);
        }
    }

    /// Checks that giving `module` exactly `prerequisites` keeps the graph acyclic.
    pub fn validate_replacement(
        &self,
        module: &str,
        prerequisites: &[String],
    ) -> Result<(), GraphError> {
        if prerequisites.iter().any(|id| id == module) {
            return Err(GraphError::SelfReference);
        }

        let mut candidate = self.clone();
        candidate.replace(module, prerequisites);
        match candidate.find_cycle_through(module) {
            Some(cycle) => Err(GraphError::Cycle(cycle)),
            None => Ok(()),
        }
    }

    /// Depth-first search from `module` along prerequisite edges. Returns the path
    /// `module -> ... -> module` when one exists.
    pub fn find_cycle_through(&self, module: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = vec![module.to_string()];
        if self.dfs_back_to(module, module, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_back_to(
        &self,
        target: &str,
        current: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        for next in self.prerequisites_of(current) {
            path.push(next.to_string());
            if next == target {
                return true;
            }
            if visited.insert(next.to_string()) && self.dfs_back_to(target, next, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Orders `nodes` so every module follows its prerequisites. Edges to modules outside
    /// `nodes` are ignored. Among ready modules the smallest `rank` goes first.
    pub fn topological_order<K: Ord + Clone>(
        &self,
        nodes: &[(String, K)],
    ) -> Result<Vec<String>, GraphError> {
        let ranks: HashMap<&str, &K> = nodes.iter().map(|(id, rank)| (id.as_str(), rank)).collect();
        let mut indegree: HashMap<&str, usize> = nodes.iter().map(|(id, _)| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (module, _) in nodes {
            for prerequisite in self.prerequisites_of(module) {
                if ranks.contains_key(prerequisite) {
                    *indegree.entry(module.as_str()).or_default() += 1;
                    dependents.entry(prerequisite).or_default().push(module.as_str());
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(K, &str)>> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(((*ranks[id]).clone(), *id)))
            .collect();

        let mut ordered = Vec::with_capacity(nodes.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            ordered.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(((*ranks[dependent]).clone(), *dependent)));
                    }
                }
            }
        }

        if ordered.len() < nodes.len() {
            let stuck = nodes
                .iter()
                .find(|(id, _)| !ordered.contains(id))
                .and_then(|(id, _)| self.find_cycle_through(id))
                .unwrap_or_default();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn rejects_self_reference() {
        let graph = PrerequisiteGraph::default();
        assert_eq!(
            graph.validate_replacement("a", &ids(&["a"])),
            Err(GraphError::SelfReference)
        );
    }

    #[test]
    fn detects_indirect_cycle_with_path() {
        // c requires b, b requires a; making a require c closes the loop.
        let graph = PrerequisiteGraph::from_edges([("c", "b"), ("b", "a")]);
        let err = graph.validate_replacement("a", &ids(&["c"])).unwrap_err();
        assert_eq!(err, GraphError::Cycle(ids(&["a", "c", "b", "a"])));
        assert_eq!(err.to_string(), "circular prerequisite: a -> c -> b -> a");
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = PrerequisiteGraph::from_edges([("d", "b"), ("d", "c"), ("b", "a"), ("c", "a")]);
        assert!(graph.validate_replacement("e", &ids(&["d", "a"])).is_ok());
        assert!(graph.find_cycle_through("d").is_none());
    }

    #[test]
    fn replacement_drops_old_edges() {
        let graph = PrerequisiteGraph::from_edges([("b", "a")]);
        // a -> b would be a cycle only while b still requires a.
        assert!(graph.validate_replacement("a", &ids(&["b"])).is_err());
        let mut updated = graph.clone();
        updated.replace("b", &[]);
        assert!(updated.validate_replacement("a", &ids(&["b"])).is_ok());
    }

    #[test]
    fn topological_order_respects_edges_then_rank() {
        let graph = PrerequisiteGraph::from_edges([("advanced", "basics"), ("project", "advanced")]);
        let nodes = vec![
            ("project".to_string(), 0),
            ("advanced".to_string(), 1),
            ("basics".to_string(), 5),
            ("elective".to_string(), 2),
        ];
        let order = graph.topological_order(&nodes).unwrap();
        assert_eq!(order, ids(&["elective", "basics", "advanced", "project"]));
    }

    #[test]
    fn topological_order_ignores_outside_edges() {
        let graph = PrerequisiteGraph::from_edges([("b", "external")]);
        let nodes = vec![("b".to_string(), 0), ("a".to_string(), 1)];
        assert_eq!(graph.topological_order(&nodes).unwrap(), ids(&["b", "a"]));
    }

    #[test]
    fn topological_order_reports_cycles() {
        let graph = PrerequisiteGraph::from_edges([("a", "b"), ("b", "a")]);
        let nodes = vec![("a".to_string(), 0), ("b".to_string(), 0)];
        assert!(matches!(graph.topological_order(&nodes), Err(GraphError::Cycle(_))));
    }

    proptest! {
        // Edges only from higher to lower index can never form a cycle.
        #[test]
        fn forward_only_edges_are_acyclic(edges in proptest::collection::vec((1usize..20, 0usize..19), 0..60)) {
            let edges: Vec<(String, String)> = edges
                .into_iter()
                .filter(|(from, to)| from > to)
                .map(|(from, to)| (format!("m{from}"), format!("m{to}")))
                .collect();
            let graph = PrerequisiteGraph::from_edges(edges);
            let nodes: Vec<(String, usize)> = (0..20).map(|i| (format!("m{i}"), i)).collect();
            let order = graph.topological_order(&nodes).unwrap();
            prop_assert_eq!(order.len(), 20);
            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            for (module, _) in &nodes {
                for prerequisite in graph.prerequisites_of(module) {
                    prop_assert!(position[prerequisite] < position[module.as_str()]);
                }
            }
        }

        #[test]
        fn accepted_replacements_keep_graph_acyclic(
            edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20),
            module in 0usize..8,
            prerequisites in proptest::collection::vec(0usize..8, 0..4),
        ) {
            let mut graph = PrerequisiteGraph::default();
            for (from, to) in edges {
                let from = format!("m{from}");
                let mut current: Vec<String> = graph.prerequisites_of(&from).map(str::to_string).collect();
                current.push(format!("m{to}"));
                if graph.validate_replacement(&from, &current).is_ok() {
                    graph.replace(&from, &current);
                }
            }
            let module = format!("m{module}");
            let prerequisites: Vec<String> = prerequisites.into_iter().map(|p| format!("m{p}")).collect();
            if graph.validate_replacement(&module, &prerequisites).is_ok() {
                graph.replace(&module, &prerequisites);
            }
            let nodes: Vec<(String, usize)> = (0..8).map(|i| (format!("m{i}"), i)).collect();
            prop_assert!(graph.topological_order(&nodes).is_ok());
        }
    }
}
