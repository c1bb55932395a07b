//! Shortest paths and next hops.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

use log::debug;

use super::graph::{Adjacency, RoutingGraph};

/// Tentative cost and predecessor of a node in a shortest path search
#[derive(Debug, Clone, PartialEq)]
pub struct PathEntry {
    pub cost: f64,
    pub predecessor: Option<String>,
}

/// Result of a single-source shortest path search
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    source: String,
    entries: BTreeMap<String, PathEntry>,
}

impl PathResult {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Total cost from the source, +inf for unknown or unreachable nodes
    pub fn cost(&self, node: &str) -> f64 {
        self.entries.get(node).map_or(f64::INFINITY, |entry| entry.cost)
    }

    pub fn predecessor(&self, node: &str) -> Option<&str> {
        self.entries.get(node)?.predecessor.as_deref()
    }

    pub fn is_reachable(&self, node: &str) -> bool {
        self.cost(node).is_finite()
    }

    pub fn entries(&self) -> &BTreeMap<String, PathEntry> {
        &self.entries
    }
}

/// Heap key: cost first, then push order so equal costs pop first-in first-out.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    cost: f64,
    seq: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra from `source`, weighting each edge with `edge_cost`.
///
/// Every node starts at +inf except the source at 0. A node's predecessor is
/// only replaced on a strictly smaller cost. Nodes never reached keep +inf
/// and no predecessor.
pub fn resolve<F>(graph: &RoutingGraph, source: &str, edge_cost: F) -> PathResult
where
    F: Fn(&Adjacency) -> f64,
{
    let mut entries: BTreeMap<String, PathEntry> = graph
        .nodes()
        .map(|node| {
            (
                node.to_string(),
                PathEntry {
                    cost: f64::INFINITY,
                    predecessor: None,
                },
            )
        })
        .collect();
    entries.insert(
        source.to_string(),
        PathEntry {
            cost: 0.0,
            predecessor: None,
        },
    );

    let mut seq = 0;
    let mut queue = BinaryHeap::new();
    queue.push(Reverse((Candidate { cost: 0.0, seq }, source.to_string())));

    while let Some(Reverse((candidate, node))) = queue.pop() {
        // Stale entry: a cheaper path to this node was already settled
        if candidate.cost > entries.get(&node).map_or(f64::INFINITY, |e| e.cost) {
            continue;
        }
        for edge in graph.edges(&node) {
            let distance = candidate.cost + edge_cost(edge);
            let Some(entry) = entries.get_mut(&edge.neighbor) else {
                continue;
            };
            if distance < entry.cost {
                entry.cost = distance;
                entry.predecessor = Some(node.clone());
                seq += 1;
                queue.push(Reverse((Candidate { cost: distance, seq }, edge.neighbor.clone())));
            }
        }
    }

    PathResult {
        source: source.to_string(),
        entries,
    }
}

/// Next hop from the search source towards every reachable destination.
///
/// Walks each destination's predecessor chain back to the source. If the
/// chain runs into a node with +inf cost or no predecessor before reaching
/// the source, the destination is left out.
pub fn derive_next_hops(source: &str, result: &PathResult) -> BTreeMap<String, String> {
    let mut hops = BTreeMap::new();
    let limit = result.entries().len();

    'destinations: for (destination, entry) in result.entries() {
        if destination == source || !entry.cost.is_finite() {
            continue;
        }
        let mut next_hop = destination.as_str();
        let mut previous = entry.predecessor.as_deref();
        for _ in 0..limit {
            match previous {
                Some(node) if node == source => {
                    hops.insert(destination.clone(), next_hop.to_string());
                    continue 'destinations;
                }
                Some(node) if result.is_reachable(node) => {
                    next_hop = node;
                    previous = result.predecessor(node);
                }
                _ => continue 'destinations,
            }
        }
        debug!("Predecessor chain from {} to {} does not terminate", source, destination);
    }

    hops
}

/// Next hops for every (source, destination) pair of a graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NextHopTable {
    hops: BTreeMap<String, BTreeMap<String, String>>,
    unreachable: Vec<(String, String)>,
}

impl NextHopTable {
    /// Run one search per node with inverse-bandwidth edge costs.
    pub fn compute(graph: &RoutingGraph) -> Self {
        Self::compute_with(graph, |edge| edge.params.cost())
    }

    pub fn compute_with<F>(graph: &RoutingGraph, edge_cost: F) -> Self
    where
        F: Fn(&Adjacency) -> f64,
    {
        let mut table = Self::default();
        for source in graph.nodes() {
            let result = resolve(graph, source, &edge_cost);
            let hops = derive_next_hops(source, &result);
            for destination in graph.nodes() {
                if destination != source && !hops.contains_key(destination) {
                    table
                        .unreachable
                        .push((source.to_string(), destination.to_string()));
                }
            }
            table.hops.insert(source.to_string(), hops);
        }
        table
    }

    pub fn next_hop(&self, source: &str, destination: &str) -> Option<&str> {
        self.hops.get(source)?.get(destination).map(String::as_str)
    }

    /// All `(source, destination, next_hop)` triples in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.hops.iter().flat_map(|(source, hops)| {
            hops.iter()
                .map(move |(destination, hop)| (source.as_str(), destination.as_str(), hop.as_str()))
        })
    }

    /// Pairs with no path between them
    pub fn unreachable_pairs(&self) -> &[(String, String)] {
        &self.unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkParams;
    use crate::topology::{add_link, Snapshot};
    use std::net::Ipv4Addr;

    fn link(snapshot: &mut Snapshot, a: &str, b: &str, subnet: u8, bandwidth: f64) {
        add_link(
            snapshot,
            (a, Ipv4Addr::new(10, 0, subnet, 1)),
            (b, Ipv4Addr::new(10, 0, subnet, 2)),
            LinkParams::new(bandwidth, 32.0, 1.0).unwrap(),
        )
        .unwrap();
    }

    fn close(x: f64, y: f64) -> bool {
        (x - y).abs() < 1e-9
    }

    #[test]
    fn test_linear_chain() {
        let mut snapshot = Snapshot::default();
        link(&mut snapshot, "A", "B", 1, 10.0);
        link(&mut snapshot, "B", "C", 2, 5.0);
        let graph = RoutingGraph::from_snapshot(&snapshot);

        let result = resolve(&graph, "A", |e| e.params.cost());
        assert_eq!(result.cost("A"), 0.0);
        assert!(close(result.cost("B"), 0.1));
        assert!(close(result.cost("C"), 0.3));
        assert_eq!(result.predecessor("C"), Some("B"));

        let hops = derive_next_hops("A", &result);
        assert_eq!(hops.get("C").map(String::as_str), Some("B"));
        assert_eq!(hops.get("B").map(String::as_str), Some("B"));
    }

    #[test]
    fn test_direct_unit_link() {
        let mut snapshot = Snapshot::default();
        link(&mut snapshot, "A", "B", 1, 1.0);
        let graph = RoutingGraph::from_snapshot(&snapshot);

        let result = resolve(&graph, "A", |e| e.params.cost());
        assert_eq!(result.cost("B"), 1.0);
        assert_eq!(derive_next_hops("A", &result).get("B").map(String::as_str), Some("B"));
    }

    #[test]
    fn test_prefers_fast_detour() {
        // A-D is slow, A-B-C-D is made of fast hops
        let mut snapshot = Snapshot::default();
        link(&mut snapshot, "A", "D", 1, 1.0);
        link(&mut snapshot, "A", "B", 2, 100.0);
        link(&mut snapshot, "B", "C", 3, 100.0);
        link(&mut snapshot, "C", "D", 4, 100.0);
        let graph = RoutingGraph::from_snapshot(&snapshot);

        let result = resolve(&graph, "A", |e| e.params.cost());
        assert!(close(result.cost("D"), 0.03));

        let table = NextHopTable::compute(&graph);
        assert_eq!(table.next_hop("A", "D"), Some("B"));
        assert_eq!(table.next_hop("D", "A"), Some("C"));
        assert_eq!(table.next_hop("B", "D"), Some("C"));
    }

    #[test]
    fn test_unreachable_nodes() {
        let mut snapshot = Snapshot::default();
        link(&mut snapshot, "A", "B", 1, 10.0);
        link(&mut snapshot, "X", "Y", 2, 10.0);
        let graph = RoutingGraph::from_snapshot(&snapshot);

        let result = resolve(&graph, "A", |e| e.params.cost());
        assert_eq!(result.cost("X"), f64::INFINITY);
        assert_eq!(result.predecessor("X"), None);
        assert!(!derive_next_hops("A", &result).contains_key("X"));

        let table = NextHopTable::compute(&graph);
        assert!(table
            .unreachable_pairs()
            .contains(&("A".to_string(), "Y".to_string())));
        assert_eq!(table.unreachable_pairs().len(), 8);
    }

    #[test]
    fn test_broken_predecessor_chain_is_excluded() {
        let mut entries = BTreeMap::new();
        entries.insert("S".to_string(), PathEntry { cost: 0.0, predecessor: None });
        entries.insert(
            "M".to_string(),
            PathEntry {
                cost: f64::INFINITY,
                predecessor: None,
            },
        );
        entries.insert(
            "D".to_string(),
            PathEntry {
                cost: 1.0,
                predecessor: Some("M".to_string()),
            },
        );
        let result = PathResult {
            source: "S".to_string(),
            entries,
        };

        assert!(derive_next_hops("S", &result).is_empty());
    }

    #[test]
    fn test_custom_cost_function() {
        let mut snapshot = Snapshot::default();
        link(&mut snapshot, "A", "B", 1, 10.0);
        link(&mut snapshot, "B", "C", 2, 10.0);
        link(&mut snapshot, "A", "C", 3, 1.0);
        let graph = RoutingGraph::from_snapshot(&snapshot);

        // Hop count ignores bandwidth, so the direct link wins
        let table = NextHopTable::compute_with(&graph, |_| 1.0);
        assert_eq!(table.next_hop("A", "C"), Some("C"));

        let table = NextHopTable::compute(&graph);
        assert_eq!(table.next_hop("A", "C"), Some("B"));
    }
}
