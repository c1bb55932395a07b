//! Routing graph derived from a snapshot.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::link::LinkParams;
use crate::topology::Snapshot;

/// A directed edge out of a node
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacency {
    pub neighbor: String,
    pub link_id: String,
    pub params: LinkParams,
    /// Neighbor's address on the link, used as the gateway
    pub neighbor_ip: Ipv4Addr,
    /// Local interface the link is attached to
    pub interface: String,
}

/// Adjacency lists for every node of a snapshot
#[derive(Debug, Clone, Default)]
pub struct RoutingGraph {
    adjacency: BTreeMap<String, Vec<Adjacency>>,
}

impl RoutingGraph {
    /// Build both directed edges for every link. Nodes without links are
    /// kept so that they show up as unreachable.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut adjacency: BTreeMap<String, Vec<Adjacency>> = snapshot
            .nodes
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();

        for link in snapshot.links.values() {
            let [a, b] = &link.endpoints;
            for (local, remote) in [(a, b), (b, a)] {
                adjacency.entry(local.node.clone()).or_default().push(Adjacency {
                    neighbor: remote.node.clone(),
                    link_id: link.id.clone(),
                    params: link.params,
                    neighbor_ip: remote.ip,
                    interface: local.interface.clone(),
                });
            }
        }

        Self { adjacency }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.adjacency.keys().map(String::as_str)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn edges(&self, node: &str) -> &[Adjacency] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The edge `source` uses to reach its neighbor `next_hop`. With parallel
    /// links the cheapest one wins, then the first in link id order.
    pub fn gateway(&self, source: &str, next_hop: &str) -> Option<&Adjacency> {
        self.edges(source)
            .iter()
            .filter(|edge| edge.neighbor == next_hop)
            .min_by(|x, y| x.params.cost().total_cmp(&y.params.cost()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::add_link;

    #[test]
    fn test_both_directions_and_isolated_nodes() {
        let mut snapshot = Snapshot::default();
        snapshot.declare_node("island", None);
        add_link(
            &mut snapshot,
            ("a", Ipv4Addr::new(10, 0, 0, 1)),
            ("b", Ipv4Addr::new(10, 0, 0, 2)),
            LinkParams::new(10.0, 32.0, 1.0).unwrap(),
        )
        .unwrap();

        let graph = RoutingGraph::from_snapshot(&snapshot);
        assert_eq!(graph.len(), 3);
        assert!(graph.edges("island").is_empty());

        let ab = graph.gateway("a", "b").unwrap();
        assert_eq!(ab.neighbor_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ab.interface, "eth0");

        let ba = graph.gateway("b", "a").unwrap();
        assert_eq!(ba.neighbor_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert!(graph.gateway("a", "island").is_none());
    }

    #[test]
    fn test_parallel_links_prefer_cheapest() {
        let mut snapshot = Snapshot::default();
        add_link(
            &mut snapshot,
            ("a", Ipv4Addr::new(10, 0, 0, 1)),
            ("b", Ipv4Addr::new(10, 0, 0, 2)),
            LinkParams::new(1.0, 32.0, 1.0).unwrap(),
        )
        .unwrap();
        add_link(
            &mut snapshot,
            ("b", Ipv4Addr::new(10, 0, 1, 2)),
            ("a", Ipv4Addr::new(10, 0, 1, 1)),
            LinkParams::new(100.0, 32.0, 1.0).unwrap(),
        )
        .unwrap();

        let graph = RoutingGraph::from_snapshot(&snapshot);
        let gateway = graph.gateway("a", "b").unwrap();
        assert_eq!(gateway.link_id, "b-a");
        assert_eq!(gateway.interface, "eth1");
    }
}
