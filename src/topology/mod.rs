//! Topology model.
//!
//! The snapshot is the single source of truth for nodes, links, per-node IP
//! sets and interface counters. The store persists it atomically and the
//! lifecycle functions mutate it one link at a time.

pub mod lifecycle;
pub mod store;
pub mod types;

pub use lifecycle::{add_link, address_command, remove_link, LinkRemoval};
pub use store::{FileStore, MemoryStore, Store, StoreLock};
pub use types::{link_id, Endpoint, Link, Node, Snapshot};
