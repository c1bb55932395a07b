//! # topoctl - Topology controller for emulated networks
//!
//! This library keeps a live model of a multi-node network and keeps every
//! node's routing table consistent with it as links come and go.
//!
//! ## Overview
//!
//! The controller owns a persisted snapshot of nodes, links, per-link
//! shaping parameters, per-node IP sets and interface counters. Each change
//! (adding or removing a link, declaring a node) is committed to the
//! snapshot first, then turned into shell commands run inside the affected
//! nodes: address assignment, `tc` shaping, and `ip route` updates.
//!
//! ## Key Features
//!
//! - **Shortest paths**: Dijkstra over `1 / bandwidth` link costs
//! - **Minimal updates**: only routes that changed are sent to the nodes
//! - **Failure isolation**: a failing route is retried once and reported
//!   against its node pair without blocking the others
//! - **Crash recovery**: the snapshot is written atomically and interface
//!   names are never reused across restarts
//!
//! ## Architecture
//!
//! - `link`: Link shaping parameters and queue statistics
//! - `topology`: Snapshot model, persistence and link lifecycle
//! - `routing`: Routing graph, path resolution, route tables and reconciliation
//! - `executor`: Running commands inside nodes
//! - `controller`: The serialized load, mutate, persist, reconcile cycle
//! - `config` / `config_loader`: YAML configuration
//! - `utils`: Address helpers
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use topoctl::controller::Controller;
//! use topoctl::executor::ShellExecutor;
//! use topoctl::link::LinkParams;
//! use topoctl::routing::CancelToken;
//! use topoctl::topology::FileStore;
//!
//! let controller = Controller::new(
//!     FileStore::new("state/topology.json"),
//!     Arc::new(ShellExecutor::netns()),
//!     Duration::from_secs(10),
//! );
//! let (link, outcome) = controller.add_link(
//!     ("r1", Ipv4Addr::new(10, 0, 1, 1)),
//!     ("r2", Ipv4Addr::new(10, 0, 1, 2)),
//!     LinkParams::new(10.0, 32.0, 5.0)?,
//!     &CancelToken::new(),
//! )?;
//! println!("{} added, {} routes applied", link.id, outcome.routes.applied);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Error Handling
//!
//! Library operations return [`error::ControllerError`]. Per-route failures
//! are not errors: they are collected in the reconciliation report. The
//! binary wraps everything in `color_eyre` for reporting.

pub mod config;
pub mod config_loader;
pub mod controller;
pub mod error;
pub mod executor;
pub mod link;
pub mod routing;
pub mod topology;
pub mod utils;
