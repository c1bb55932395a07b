//! The topology controller.
//!
//! Every mutation runs as one critical section: load the snapshot, change
//! it, persist it, then push addresses, shaping and routes to the nodes. A
//! failure before the save leaves the persisted snapshot as it was. Once the
//! snapshot is saved the model is committed, and device commands that fail
//! afterwards are reported in the outcome rather than rolled back.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::config::TopologyConfig;
use crate::error::{ControllerError, Result};
use crate::executor::{run_checked, NodeExecutor};
use crate::link::{parse_qdisc_stats, stats_command, LinkParams, QdiscStats};
use crate::routing::{apply, reconcile, CancelToken, ReconcileReport, RouteCommand, RouteTable, RoutingState};
use crate::topology::{self, address_command, Endpoint, Link, Snapshot, Store, StoreLock};

/// What happened on the devices after a committed mutation
#[derive(Debug, Default)]
pub struct Outcome {
    /// Address and shaping commands that still failed after their retry
    pub setup_failures: Vec<ControllerError>,
    pub routes: ReconcileReport,
}

impl Outcome {
    pub fn is_clean(&self) -> bool {
        self.setup_failures.is_empty() && self.routes.is_clean()
    }
}

/// Result of pushing a configured topology
#[derive(Debug, Default)]
pub struct BootstrapOutcome {
    /// Links created by this run
    pub added: Vec<String>,
    /// Configured links that already existed
    pub existing: Vec<String>,
    pub outcome: Outcome,
}

/// Queue statistics of one link endpoint
#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub endpoint: Endpoint,
    pub qdiscs: Vec<QdiscStats>,
}

/// Drives a topology snapshot and the nodes it describes
pub struct Controller<S: Store> {
    store: S,
    executor: Arc<dyn NodeExecutor>,
    timeout: Duration,
    mutation: Mutex<()>,
}

impl<S: Store> Controller<S> {
    pub fn new(store: S, executor: Arc<dyn NodeExecutor>, timeout: Duration) -> Self {
        Self {
            store,
            executor,
            timeout,
            mutation: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serialize a mutation against this controller and any other process
    /// sharing the store. Both guards are held from load through save and
    /// device push.
    fn lock(&self) -> Result<(MutexGuard<'_, ()>, StoreLock)> {
        // The guard protects no data, a panicked holder leaves nothing torn
        let local = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = self.store.lock()?;
        Ok((local, shared))
    }

    /// Current snapshot, read without taking the mutation lock.
    ///
    /// The store replaces the snapshot atomically, so this sees either the
    /// state before or after a concurrent mutation, never a mix.
    pub fn status(&self) -> Result<Snapshot> {
        self.store.load()
    }

    /// Add a link, configure both endpoints and update routes everywhere.
    pub fn add_link(
        &self,
        a: (&str, Ipv4Addr),
        b: (&str, Ipv4Addr),
        params: LinkParams,
        cancel: &CancelToken,
    ) -> Result<(Link, Outcome)> {
        let _guard = self.lock()?;
        let before = self.store.load()?;
        let mut after = before.clone();
        let link = topology::add_link(&mut after, a, b, params)?;
        let after = self.commit(after)?;

        let setup_failures = self.configure_link(&link);
        let routes = self.push_routes(&before, &after, Vec::new(), cancel);
        Ok((
            link,
            Outcome {
                setup_failures,
                routes,
            },
        ))
    }

    /// Remove a link and withdraw or reroute everything that used it.
    pub fn remove_link(&self, id: &str, cancel: &CancelToken) -> Result<(Link, Outcome)> {
        let _guard = self.lock()?;
        let before = self.store.load()?;
        let mut after = before.clone();
        let removal = topology::remove_link(&mut after, id)?;
        let after = self.commit(after)?;

        let routes = self.push_routes(&before, &after, removal.withdrawn, cancel);
        Ok((
            removal.link,
            Outcome {
                setup_failures: Vec::new(),
                routes,
            },
        ))
    }

    /// Declare a node, or set the address of an existing one.
    pub fn declare_node(
        &self,
        id: &str,
        address: Option<Ipv4Addr>,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        if id.trim().is_empty() {
            return Err(ControllerError::invalid("node name cannot be empty"));
        }
        let _guard = self.lock()?;
        let before = self.store.load()?;
        let mut after = before.clone();
        if after.declare_node(id, address) {
            info!("Declared node {}", id);
        }
        if after.same_graph(&before) {
            debug!("Node {} unchanged", id);
            return Ok(Outcome::default());
        }
        let after = self.commit(after)?;

        let routes = self.push_routes(&before, &after, Vec::new(), cancel);
        Ok(Outcome {
            setup_failures: Vec::new(),
            routes,
        })
    }

    /// Forget a node no link references any more.
    pub fn remove_node(&self, id: &str, cancel: &CancelToken) -> Result<Outcome> {
        let _guard = self.lock()?;
        let before = self.store.load()?;
        let mut after = before.clone();
        after.remove_node(id)?;
        let after = self.commit(after)?;
        info!("Removed node {}", id);

        let routes = self.push_routes(&before, &after, Vec::new(), cancel);
        Ok(Outcome {
            setup_failures: Vec::new(),
            routes,
        })
    }

    /// Push the complete route table as if the nodes held no routes.
    ///
    /// Installs that hit an existing route fall back to `ip route change`,
    /// so this converges devices left behind by a failed or cancelled run.
    pub fn sync_routes(&self, cancel: &CancelToken) -> Result<ReconcileReport> {
        let _guard = self.lock()?;
        let snapshot = self.store.load()?;
        let state = RoutingState::compute(&snapshot);
        let commands = reconcile(&RouteTable::default(), &state.routes);
        info!("Syncing {} routes", commands.len());

        let mut report = apply(&commands, self.executor.as_ref(), self.timeout, cancel);
        report.unreachable = state.next_hops.unreachable_pairs().to_vec();
        log_report(&report);
        Ok(report)
    }

    /// Reshape every linked interface of a node.
    ///
    /// This overrides the device queues only: the stored link parameters,
    /// and therefore path costs, stay as they are.
    pub fn limit_node(&self, node: &str, params: LinkParams) -> Result<Outcome> {
        let _guard = self.lock()?;
        let snapshot = self.store.load()?;
        if snapshot.node(node).is_none() {
            return Err(ControllerError::UnknownNode {
                node_id: node.to_string(),
            });
        }

        let interfaces = snapshot.interfaces_of(node);
        if interfaces.is_empty() {
            warn!("Node {} has no linked interfaces to limit", node);
        }
        let mut outcome = Outcome::default();
        for interface in interfaces {
            info!("Limiting {} {} to {}", node, interface, params);
            if let Err(e) = self.shape(node, &interface, &params) {
                outcome.setup_failures.push(e);
            }
        }
        Ok(outcome)
    }

    /// Query the queue statistics on both ends of a link.
    pub fn link_stats(&self, id: &str) -> Result<Vec<EndpointStats>> {
        let snapshot = self.store.load()?;
        let link = snapshot.link(id).ok_or_else(|| ControllerError::LinkNotFound {
            link_id: id.to_string(),
        })?;

        link.endpoints
            .iter()
            .map(|endpoint| {
                let output = run_checked(
                    self.executor.as_ref(),
                    &endpoint.node,
                    &stats_command(&endpoint.interface),
                    self.timeout,
                )?;
                Ok(EndpointStats {
                    endpoint: endpoint.clone(),
                    qdiscs: parse_qdisc_stats(&output.stdout),
                })
            })
            .collect()
    }

    /// Create the configured nodes and links, then push all routes.
    ///
    /// Links that already exist are left alone, so running this twice is
    /// harmless.
    pub fn bootstrap(&self, topology: &TopologyConfig, cancel: &CancelToken) -> Result<BootstrapOutcome> {
        let _guard = self.lock()?;
        let before = self.store.load()?;
        let mut after = before.clone();

        for (name, address) in &topology.nodes {
            after.declare_node(name, Some(*address));
        }

        let mut result = BootstrapOutcome::default();
        let mut created = Vec::new();
        for link in &topology.links {
            let id = link.id();
            if after.links.contains_key(&id) {
                debug!("Link {} already exists, skipping", id);
                result.existing.push(id);
                continue;
            }
            let params = link
                .params()
                .map_err(|e| ControllerError::invalid(e.to_string()))?;
            created.push(topology::add_link(
                &mut after,
                (&link.a, link.a_ip),
                (&link.b, link.b_ip),
                params,
            )?);
            result.added.push(id);
        }

        let after = if after.same_graph(&before) {
            after
        } else {
            self.commit(after)?
        };

        for link in &created {
            result.outcome.setup_failures.extend(self.configure_link(link));
        }

        let state = RoutingState::compute(&after);
        let commands = reconcile(&RouteTable::default(), &state.routes);
        let mut report = apply(&commands, self.executor.as_ref(), self.timeout, cancel);
        report.unreachable = state.next_hops.unreachable_pairs().to_vec();
        log_report(&report);
        result.outcome.routes = report;

        info!(
            "Bootstrap done: {} links added, {} already present",
            result.added.len(),
            result.existing.len()
        );
        Ok(result)
    }

    fn commit(&self, mut snapshot: Snapshot) -> Result<Snapshot> {
        snapshot.updated_at = Some(Utc::now());
        self.store.save(&snapshot)?;
        Ok(snapshot)
    }

    fn run(&self, node: &str, command: &str) -> Result<()> {
        run_checked(self.executor.as_ref(), node, command, self.timeout).map(|_| ())
    }

    /// Assign addresses and install shaping on both endpoints of a new link.
    fn configure_link(&self, link: &Link) -> Vec<ControllerError> {
        let mut failures = Vec::new();
        for endpoint in &link.endpoints {
            let address = address_command(endpoint);
            if let Err(e) = self.run(&address.node, &address.command) {
                warn!("{}", e);
                failures.push(e);
            }
            if let Err(e) = self.shape(&endpoint.node, &endpoint.interface, &link.params) {
                failures.push(e);
            }
        }
        failures
    }

    /// Install shaping on an interface. If either qdisc fails, whatever is
    /// there is cleared and both are installed once more.
    fn shape(&self, node: &str, interface: &str, params: &LinkParams) -> Result<()> {
        let [rate, delay] = params.shaping_commands(interface);
        let first = [self.run(node, &rate), self.run(node, &delay)];
        if first.iter().all(Result::is_ok) {
            return Ok(());
        }
        warn!("Shaping {} on {} failed, clearing and retrying", interface, node);

        for clear in LinkParams::clear_commands(interface) {
            if let Err(e) = self.run(node, &clear) {
                debug!("Ignoring failed clear: {}", e);
            }
        }
        self.run(node, &rate)?;
        self.run(node, &delay)
    }

    /// Diff the routes of two snapshots and apply the difference.
    ///
    /// `withdrawn` holds direct routes of a removed link. They are only sent
    /// when neither the diff nor the new table already covers the same
    /// (node, address).
    fn push_routes(
        &self,
        before: &Snapshot,
        after: &Snapshot,
        withdrawn: Vec<RouteCommand>,
        cancel: &CancelToken,
    ) -> ReconcileReport {
        let old = RoutingState::compute(before);
        let new = RoutingState::compute(after);
        let diff = reconcile(&old.routes, &new.routes);

        let mut commands: Vec<RouteCommand> = withdrawn
            .into_iter()
            .filter(|withdrawal| {
                let in_diff = diff.iter().any(|command| {
                    command.node() == withdrawal.node() && command.destination() == withdrawal.destination()
                });
                let still_routed = new
                    .routes
                    .get(withdrawal.node(), withdrawal.destination_node())
                    .is_some_and(|route| route.destinations.contains(&withdrawal.destination()));
                !in_diff && !still_routed
            })
            .collect();
        commands.extend(diff);
        debug!("{} route commands to apply", commands.len());

        let mut report = apply(&commands, self.executor.as_ref(), self.timeout, cancel);
        report.unreachable = new.next_hops.unreachable_pairs().to_vec();
        log_report(&report);
        report
    }
}

fn log_report(report: &ReconcileReport) {
    info!(
        "Routes: {} applied ({} on retry), {} failed, {} skipped",
        report.applied,
        report.retried,
        report.failures.len(),
        report.skipped
    );
    if !report.unreachable.is_empty() {
        warn!("{} node pairs have no path", report.unreachable.len());
        for (source, destination) in &report.unreachable {
            debug!("No path from {} to {}", source, destination);
        }
    }
}
