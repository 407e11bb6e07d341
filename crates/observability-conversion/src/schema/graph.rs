use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;

/// Undirected graph of versions. Edges are kept in insertion order so that
/// path search is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionGraph {
    edges: IndexMap<String, Vec<String>>,
}

impl VersionGraph {
    pub fn add_node(&mut self, version: impl Into<String>) {
        self.edges.entry(version.into()).or_default();
    }

    pub fn contains(&self, version: &str) -> bool {
        self.edges.contains_key(version)
    }

    pub fn add_edge(&mut self, lhs: &str, rhs: &str) {
        for (from, to) in [(lhs, rhs), (rhs, lhs)] {
            let neighbours = self.edges.entry(from.to_owned()).or_default();
            if !neighbours.iter().any(|neighbour| neighbour == to) {
                neighbours.push(to.to_owned());
            }
        }
    }

    pub fn neighbours(&self, version: &str) -> &[String] {
        self.edges.get(version).map_or(&[], Vec::as_slice)
    }

    /// Breadth-first search for the shortest path from `from` to `to`, both
    /// ends included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }

        let mut predecessors: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        predecessors.insert(from, from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to.to_owned()];
                let mut step = to;
                while step != from {
                    step = *predecessors.get(step)?;
                    path.push(step.to_owned());
                }
                path.reverse();
                return Some(path);
            }

            for neighbour in self.neighbours(current) {
                if !predecessors.contains_key(neighbour.as_str()) {
                    predecessors.insert(neighbour, current);
                    queue.push_back(neighbour);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(versions: &[&str]) -> VersionGraph {
        let mut graph = VersionGraph::default();
        for pair in versions.windows(2) {
            graph.add_edge(pair[0], pair[1]);
        }
        graph
    }

    #[test]
    fn path_to_itself() {
        let graph = chain(&["v1alpha1", "v1beta1"]);
        assert_eq!(
            graph.shortest_path("v1beta1", "v1beta1"),
            Some(vec!["v1beta1".to_owned()])
        );
    }

    #[test]
    fn shortcut_edges_are_preferred() {
        let mut graph = chain(&["v1alpha1", "v1alpha2", "v1beta1", "v1"]);
        graph.add_edge("v1alpha1", "v1beta1");

        assert_eq!(
            graph.shortest_path("v1alpha1", "v1"),
            Some(vec!["v1alpha1".into(), "v1beta1".into(), "v1".into()])
        );
    }

    #[test]
    fn disconnected_versions_have_no_path() {
        let mut graph = chain(&["v1alpha1", "v1beta1"]);
        graph.add_node("v2");

        assert_eq!(graph.shortest_path("v1alpha1", "v2"), None);
        assert_eq!(graph.shortest_path("v1alpha1", "v3"), None);
    }
}
