//! Route computation and reconciliation.
//!
//! Routing is recomputed from the whole snapshot after every change: the
//! graph is rebuilt, every node runs a single-source shortest path search
//! over inverse-bandwidth costs, and the resulting next hops are expanded
//! into per-node host routes. Reconciliation diffs two such route tables
//! into the `ip route` commands that move devices from one to the other.

pub mod graph;
pub mod path;
pub mod reconcile;
pub mod table;

pub use graph::{Adjacency, RoutingGraph};
pub use path::{derive_next_hops, resolve, NextHopTable, PathEntry, PathResult};
pub use reconcile::{apply, reconcile, CancelToken, PairFailure, ReconcileReport, RouteCommand};
pub use table::{PairRoute, RouteTable, RoutingState};
