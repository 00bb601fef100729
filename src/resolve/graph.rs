//! Graph queries over the selected packages

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

/// Package name -> names of its dependencies
pub type Edges = BTreeMap<String, BTreeSet<String>>;

fn build(edges: &Edges) -> DiGraphMap<&str, ()> {
    let mut graph = DiGraphMap::new();
    for (from, targets) in edges {
        graph.add_node(from.as_str());
        for to in targets {
            graph.add_edge(from.as_str(), to.as_str(), ());
        }
    }
    graph
}

/// Every name reachable from `roots`, roots included
pub fn reachable<'a>(roots: impl IntoIterator<Item = &'a str>, edges: &Edges) -> BTreeSet<String> {
    let mut graph = build(edges);
    let roots: Vec<&str> = roots.into_iter().collect();
    for root in &roots {
        graph.add_node(*root);
    }

    let mut seen = BTreeSet::new();
    let mut dfs = Dfs::empty(&graph);
    for root in roots {
        dfs.move_to(root);
        while let Some(node) = dfs.next(&graph) {
            seen.insert(node.to_string());
        }
    }
    seen
}

/// Cycles in the graph, one per strongly connected component.
///
/// Each cycle starts at its lexicographically smallest member and follows
/// real edges, so `[a, b, c]` means `a -> b -> c -> a`.
pub fn find_cycles(edges: &Edges) -> Vec<Vec<String>> {
    let graph = build(edges);
    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .filter_map(|scc| {
            let members: BTreeSet<&str> = scc.into_iter().collect();
            shortest_cycle(&graph, &members)
        })
        .collect();
    cycles.sort();
    cycles
}

/// Breadth-first search back to the smallest member, neighbors in name order
fn shortest_cycle(graph: &DiGraphMap<&str, ()>, members: &BTreeSet<&str>) -> Option<Vec<String>> {
    let start = *members.iter().next()?;
    let mut parents: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut neighbors: Vec<&str> = graph
            .neighbors(node)
            .filter(|n| members.contains(n))
            .collect();
        neighbors.sort_unstable();

        for next in neighbors {
            if next == start {
                let mut path = vec![node.to_string()];
                let mut cursor = node;
                while cursor != start {
                    cursor = parents[cursor];
                    path.push(cursor.to_string());
                }
                path.reverse();
                return Some(path);
            }
            if !parents.contains_key(next) {
                parents.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    None
}
