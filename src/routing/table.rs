//! Route tables materialized from next hops.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use log::warn;

use super::graph::RoutingGraph;
use super::path::NextHopTable;
use crate::topology::Snapshot;

/// How `source` reaches every address of one destination node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRoute {
    pub next_hop: String,
    /// Next hop's address on the shared link
    pub via: Ipv4Addr,
    /// Source interface facing the next hop
    pub interface: String,
    /// Host routes installed towards the destination node
    pub destinations: BTreeSet<Ipv4Addr>,
}

impl PairRoute {
    pub fn same_gateway(&self, other: &PairRoute) -> bool {
        self.next_hop == other.next_hop && self.via == other.via && self.interface == other.interface
    }
}

/// Routes every node should hold, keyed by source then destination node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: BTreeMap<String, BTreeMap<String, PairRoute>>,
}

impl RouteTable {
    /// Expand next hops into host routes towards every IP of each destination.
    pub fn build(next_hops: &NextHopTable, graph: &RoutingGraph, snapshot: &Snapshot) -> Self {
        let mut routes: BTreeMap<String, BTreeMap<String, PairRoute>> = BTreeMap::new();

        for (source, destination, next_hop) in next_hops.iter() {
            let Some(gateway) = graph.gateway(source, next_hop) else {
                warn!(
                    "No edge from {} to next hop {} while routing to {}",
                    source, next_hop, destination
                );
                continue;
            };
            let own_ips = snapshot.node(source).map(|n| n.ips.clone()).unwrap_or_default();
            let destinations: BTreeSet<Ipv4Addr> = snapshot
                .node(destination)
                .map(|node| node.ips.difference(&own_ips).copied().collect())
                .unwrap_or_default();
            if destinations.is_empty() {
                continue;
            }

            routes.entry(source.to_string()).or_default().insert(
                destination.to_string(),
                PairRoute {
                    next_hop: next_hop.to_string(),
                    via: gateway.neighbor_ip,
                    interface: gateway.interface.clone(),
                    destinations,
                },
            );
        }

        Self { routes }
    }

    pub fn get(&self, source: &str, destination: &str) -> Option<&PairRoute> {
        self.routes.get(source)?.get(destination)
    }

    /// All `(source, destination, route)` entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &PairRoute)> {
        self.routes.iter().flat_map(|(source, pairs)| {
            pairs
                .iter()
                .map(move |(destination, route)| (source.as_str(), destination.as_str(), route))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.values().all(BTreeMap::is_empty)
    }

    /// Number of host routes across all nodes
    pub fn route_count(&self) -> usize {
        self.iter().map(|(_, _, route)| route.destinations.len()).sum()
    }
}

/// Everything routing derives from one snapshot
#[derive(Debug, Clone, Default)]
pub struct RoutingState {
    pub next_hops: NextHopTable,
    pub routes: RouteTable,
}

impl RoutingState {
    pub fn compute(snapshot: &Snapshot) -> Self {
        let graph = RoutingGraph::from_snapshot(snapshot);
        let next_hops = NextHopTable::compute(&graph);
        let routes = RouteTable::build(&next_hops, &graph, snapshot);
        Self { next_hops, routes }
    }
}
