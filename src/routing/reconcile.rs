//! Route reconciliation.
//!
//! `reconcile` diffs the route table devices currently hold against the one
//! they should hold. `apply` pushes the resulting commands through a node
//! executor: nodes are worked on in parallel, commands for one node run in
//! order, and a failed command is retried once in its update form before it
//! is reported against its (source, destination) pair. Other pairs carry on.
//!
//! Cancellation is checked between pair batches. Commands that already ran
//! are not undone, so a cancelled run leaves devices partially updated; the
//! next full sync converges them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use rayon::prelude::*;

use super::table::{PairRoute, RouteTable};
use crate::error::ControllerError;
use crate::executor::{run_checked, NodeExecutor};

/// A single host route change on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteCommand {
    Install {
        node: String,
        destination_node: String,
        destination: Ipv4Addr,
        via: Ipv4Addr,
        interface: String,
    },
    Remove {
        node: String,
        destination_node: String,
        destination: Ipv4Addr,
    },
}

impl RouteCommand {
    /// Node the command runs on
    pub fn node(&self) -> &str {
        match self {
            Self::Install { node, .. } | Self::Remove { node, .. } => node,
        }
    }

    pub fn destination_node(&self) -> &str {
        match self {
            Self::Install { destination_node, .. } | Self::Remove { destination_node, .. } => {
                destination_node
            }
        }
    }

    pub fn destination(&self) -> Ipv4Addr {
        match self {
            Self::Install { destination, .. } | Self::Remove { destination, .. } => *destination,
        }
    }

    pub fn is_install(&self) -> bool {
        matches!(self, Self::Install { .. })
    }

    /// Shell form of the command
    pub fn render(&self) -> String {
        match self {
            Self::Install {
                destination,
                via,
                interface,
                ..
            } => format!("ip route add {} via {} dev {}", destination, via, interface),
            Self::Remove { destination, .. } => format!("ip route delete {}", destination),
        }
    }

    /// Form used for the single retry: installs replace whatever route is
    /// already there, removals are repeated as they are.
    pub fn retry_form(&self) -> String {
        match self {
            Self::Install {
                destination,
                via,
                interface,
                ..
            } => format!("ip route change {} via {} dev {}", destination, via, interface),
            Self::Remove { .. } => self.render(),
        }
    }
}

impl fmt::Display for RouteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.node(), self.render())
    }
}

fn installs(source: &str, destination: &str, route: &PairRoute, only: &BTreeSet<Ipv4Addr>) -> Vec<RouteCommand> {
    only.iter()
        .map(|ip| RouteCommand::Install {
            node: source.to_string(),
            destination_node: destination.to_string(),
            destination: *ip,
            via: route.via,
            interface: route.interface.clone(),
        })
        .collect()
}

fn removals<'a>(
    source: &str,
    destination: &str,
    ips: impl IntoIterator<Item = &'a Ipv4Addr>,
) -> Vec<RouteCommand> {
    ips.into_iter()
        .map(|ip| RouteCommand::Remove {
            node: source.to_string(),
            destination_node: destination.to_string(),
            destination: *ip,
        })
        .collect()
}

/// Commands that turn `old` into `new`.
///
/// A pair whose next hop or gateway changed gets all of its routes
/// reinstalled; otherwise only addresses new to the pair are installed.
/// Addresses that disappear from a pair, and pairs that disappear entirely,
/// are removed. For each pair removals come before installs. Equal tables
/// produce no commands.
pub fn reconcile(old: &RouteTable, new: &RouteTable) -> Vec<RouteCommand> {
    let pairs: BTreeSet<(&str, &str)> = old
        .iter()
        .chain(new.iter())
        .map(|(source, destination, _)| (source, destination))
        .collect();

    let mut commands = Vec::new();
    for (source, destination) in pairs {
        match (old.get(source, destination), new.get(source, destination)) {
            (Some(before), None) => {
                commands.extend(removals(source, destination, &before.destinations));
            }
            (None, Some(after)) => {
                commands.extend(installs(source, destination, after, &after.destinations));
            }
            (Some(before), Some(after)) => {
                commands.extend(removals(
                    source,
                    destination,
                    before.destinations.difference(&after.destinations),
                ));
                if before.same_gateway(after) {
                    let added: BTreeSet<Ipv4Addr> =
                        after.destinations.difference(&before.destinations).copied().collect();
                    commands.extend(installs(source, destination, after, &added));
                } else {
                    commands.extend(installs(source, destination, after, &after.destinations));
                }
            }
            (None, None) => {}
        }
    }
    commands
}

/// Shared flag used to stop an in-flight reconciliation between batches
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for signal handlers that set it directly.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// A route command that still failed after its retry
#[derive(Debug)]
pub struct PairFailure {
    pub source: String,
    pub destination: String,
    pub command: RouteCommand,
    pub error: ControllerError,
}

/// What a reconciliation run did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Commands that succeeded, on the first try or on retry
    pub applied: usize,
    /// Commands that needed their retry form
    pub retried: usize,
    /// Commands not attempted because the run was cancelled
    pub skipped: usize,
    pub failures: Vec<PairFailure>,
    /// Pairs with no path in the new topology
    pub unreachable: Vec<(String, String)>,
    pub cancelled: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    fn merge(mut self, other: Self) -> Self {
        self.applied += other.applied;
        self.retried += other.retried;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        self.unreachable.extend(other.unreachable);
        self.cancelled |= other.cancelled;
        self
    }
}

/// Group commands by node, then into consecutive per-destination batches.
fn batches(commands: &[RouteCommand]) -> BTreeMap<&str, Vec<Vec<&RouteCommand>>> {
    let mut grouped: BTreeMap<&str, Vec<Vec<&RouteCommand>>> = BTreeMap::new();
    for command in commands {
        let node_batches = grouped.entry(command.node()).or_default();
        match node_batches.last_mut() {
            Some(batch) if batch[0].destination_node() == command.destination_node() => batch.push(command),
            _ => node_batches.push(vec![command]),
        }
    }
    grouped
}

fn apply_node(
    node: &str,
    node_batches: &[Vec<&RouteCommand>],
    executor: &dyn NodeExecutor,
    timeout: Duration,
    cancel: &CancelToken,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for (index, batch) in node_batches.iter().enumerate() {
        if cancel.is_cancelled() {
            let remaining: usize = node_batches[index..].iter().map(Vec::len).sum();
            warn!("Reconciliation cancelled, {} commands on {} not applied", remaining, node);
            report.skipped += remaining;
            report.cancelled = true;
            break;
        }

        for command in batch {
            let first = command.render();
            let Err(first_error) = run_checked(executor, node, &first, timeout) else {
                report.applied += 1;
                continue;
            };
            warn!("{} failed ({}), retrying", command, first_error);

            let retry = command.retry_form();
            match run_checked(executor, node, &retry, timeout) {
                Ok(_) => {
                    report.applied += 1;
                    report.retried += 1;
                }
                Err(e) => {
                    error!("Route from {} to {} failed: {}", node, command.destination_node(), e);
                    report.failures.push(PairFailure {
                        source: node.to_string(),
                        destination: command.destination_node().to_string(),
                        command: (*command).clone(),
                        error: e,
                    });
                }
            }
        }
    }

    report
}

/// Push route commands to the nodes.
pub fn apply(
    commands: &[RouteCommand],
    executor: &dyn NodeExecutor,
    timeout: Duration,
    cancel: &CancelToken,
) -> ReconcileReport {
    let grouped = batches(commands);
    debug!("Applying {} route commands on {} nodes", commands.len(), grouped.len());

    let grouped: Vec<(&str, Vec<Vec<&RouteCommand>>)> = grouped.into_iter().collect();
    grouped
        .par_iter()
        .map(|(node, node_batches)| apply_node(node, node_batches, executor, timeout, cancel))
        .reduce(ReconcileReport::default, ReconcileReport::merge)
}
