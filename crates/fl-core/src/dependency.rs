//! Dependency-graph checks shared by task creation, dependency edits and
//! the unblock cascade.

use std::collections::{HashMap, HashSet};

/// Adjacency list: task key -> keys it depends on.
pub type DependencyGraph = HashMap<String, Vec<String>>;

/// Remove duplicates while keeping first-seen order.
pub fn dedup_keys(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect()
}

/// Find a dependency cycle reachable from `start`.
///
/// Returns the cycle as a path that begins and ends with the same key
/// (`A -> B -> A` is `["A", "B", "A"]`), or `None` when the subgraph reachable
/// from `start` is acyclic. Keys absent from the graph are leaves.
pub fn find_cycle(graph: &DependencyGraph, start: &str) -> Option<Vec<String>> {
    const NO_DEPS: &[String] = &[];

    let mut finished: HashSet<&str> = HashSet::new();
    let mut on_path: HashSet<&str> = HashSet::new();
    // Explicit DFS stack of (key, index of the next dependency to visit), so
    // long chains cannot exhaust the thread stack.
    let mut path: Vec<(&str, usize)> = vec![(start, 0)];
    on_path.insert(start);

    while let Some(frame) = path.last_mut() {
        let (node, next) = *frame;
        let deps = graph.get(node).map(Vec::as_slice).unwrap_or(NO_DEPS);
        let Some(dep) = deps.get(next).map(String::as_str) else {
            path.pop();
            on_path.remove(node);
            finished.insert(node);
            continue;
        };
        frame.1 += 1;

        if on_path.contains(dep) {
            let pos = path.iter().position(|(k, _)| *k == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[pos..].iter().map(|(k, _)| k.to_string()).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
        if !finished.contains(dep) {
            on_path.insert(dep);
            path.push((dep, 0));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges
            .iter()
            .map(|(k, deps)| (k.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let g = graph(&[("D", &["A", "B"]), ("B", &["A"]), ("A", &[])]);
        assert!(find_cycle(&g, "D").is_none());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&[("A", &["A"])]);
        assert_eq!(find_cycle(&g, "A").unwrap(), vec!["A", "A"]);
    }

    #[test]
    fn indirect_cycle_is_reported_as_path() {
        let g = graph(&[("A", &["B"]), ("B", &["C"]), ("C", &["A"])]);
        assert_eq!(find_cycle(&g, "A").unwrap(), vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let g = graph(&[("D", &["B", "C"]), ("B", &["A"]), ("C", &["A"])]);
        assert!(find_cycle(&g, "D").is_none());
    }

    #[test]
    fn very_long_chain_is_walked_without_recursion() {
        let n = 200_000;
        let mut g: DependencyGraph = (0..n)
            .map(|i| (format!("T{i}"), vec![format!("T{}", i + 1)]))
            .collect();
        assert!(find_cycle(&g, "T0").is_none());

        g.insert(format!("T{n}"), vec!["T0".to_string()]);
        let cycle = find_cycle(&g, "T0").unwrap();
        assert_eq!(cycle.len(), n + 2);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let keys = vec!["B".to_string(), "A".to_string(), "B".to_string()];
        assert_eq!(dedup_keys(&keys), vec!["B", "A"]);
    }
}
