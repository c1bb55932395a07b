use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::{error, info, warn};
use signal_hook::consts::SIGINT;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use topoctl::config::Config;
use topoctl::config_loader;
use topoctl::controller::{Controller, Outcome};
use topoctl::executor::{DryRunExecutor, NodeExecutor};
use topoctl::link::LinkParams;
use topoctl::routing::{CancelToken, ReconcileReport};
use topoctl::topology::FileStore;

/// Topology controller for emulated networks
///
/// Ctrl-C stops route pushes between batches and leaves the stored topology
/// as committed; run `sync` afterwards. A second Ctrl-C exits at once.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the controller configuration YAML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot file, overrides `controller.state_path`
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Log node commands instead of running them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the nodes and links of the configured topology
    Init,
    /// Add a link between two nodes
    AddLink {
        a: String,
        a_ip: Ipv4Addr,
        b: String,
        b_ip: Ipv4Addr,
        /// Shaping as <bandwidth>/<burst>/<latency>, e.g. 10mbit/32kb/5ms
        params: LinkParams,
    },
    /// Remove a link by id (`<a>-<b>`)
    RemoveLink { id: String },
    /// Declare a node, optionally with its own address
    Declare { node: String, address: Option<Ipv4Addr> },
    /// Reinstall every route from the stored topology
    Sync,
    /// Reshape every interface of a node
    Limit { node: String, params: LinkParams },
    /// Show queue statistics on both ends of a link
    Stats { id: String },
    /// Print the stored topology as JSON
    Status,
}

fn summarize(outcome: &Outcome) -> Result<()> {
    for failure in &outcome.setup_failures {
        error!("{}", failure);
    }
    check_routes(&outcome.routes)?;
    if !outcome.setup_failures.is_empty() {
        bail!("{} interface commands failed", outcome.setup_failures.len());
    }
    Ok(())
}

fn check_routes(report: &ReconcileReport) -> Result<()> {
    for failure in &report.failures {
        error!("{} -> {}: {}", failure.source, failure.destination, failure.error);
    }
    for (source, destination) in &report.unreachable {
        warn!("Unreachable: {} -> {}", source, destination);
    }
    if report.cancelled {
        bail!("Reconciliation cancelled, {} commands not applied", report.skipped);
    }
    if !report.failures.is_empty() {
        bail!("{} route commands failed", report.failures.len());
    }
    Ok(())
}

/// Route Ctrl-C to the cancel token. The conditional handler is registered
/// first, so it sees the flag as it was before this signal set it.
fn cancel_on_interrupt(cancel: &CancelToken) -> Result<()> {
    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, cancel.flag())
        .wrap_err("Failed to register interrupt handler")?;
    signal_hook::flag::register(SIGINT, cancel.flag()).wrap_err("Failed to register interrupt handler")?;
    Ok(())
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Load configuration, falling back to defaults without a file
    let config = match &args.config {
        Some(path) => config_loader::load_config(path)?,
        None => config_loader::default_config(),
    };
    let state_path = args
        .state
        .clone()
        .unwrap_or_else(|| config.controller.state_path.clone());
    info!("State file: {:?}", state_path);

    // Pick where node commands go
    let executor: Arc<dyn NodeExecutor> = if args.dry_run {
        info!("Dry run, no command reaches the nodes");
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(config.controller.shell_executor())
    };
    // Build the controller over the snapshot file
    let controller = Controller::new(
        FileStore::new(&state_path),
        executor,
        config.controller.command_timeout,
    );
    // Ctrl-C cancels in-flight reconciliation
    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel)?;

    run(&controller, &config, args.command, &cancel)
}

fn run(
    controller: &Controller<FileStore>,
    config: &Config,
    command: Command,
    cancel: &CancelToken,
) -> Result<()> {
    match command {
        Command::Init => {
            let Some(topology) = &config.topology else {
                bail!("The configuration has no topology section");
            };
            let result = controller.bootstrap(topology, cancel)?;
            info!(
                "Topology ready: {} links added, {} already present",
                result.added.len(),
                result.existing.len()
            );
            summarize(&result.outcome)
        }
        Command::AddLink {
            a,
            a_ip,
            b,
            b_ip,
            params,
        } => {
            let (link, outcome) = controller.add_link((&a, a_ip), (&b, b_ip), params, cancel)?;
            info!("Link {} up on {}", link.id, link.subnet);
            summarize(&outcome)
        }
        Command::RemoveLink { id } => {
            let (link, outcome) = controller.remove_link(&id, cancel)?;
            info!("Link {} removed", link.id);
            summarize(&outcome)
        }
        Command::Declare { node, address } => {
            let outcome = controller.declare_node(&node, address, cancel)?;
            summarize(&outcome)
        }
        Command::Sync => {
            let report = controller.sync_routes(cancel)?;
            check_routes(&report)
        }
        Command::Limit { node, params } => {
            let outcome = controller.limit_node(&node, params)?;
            summarize(&outcome)
        }
        Command::Stats { id } => {
            for stats in controller.link_stats(&id)? {
                println!("{} {}", stats.endpoint.node, stats.endpoint.interface);
                for qdisc in &stats.qdiscs {
                    println!(
                        "  {} {}: sent {} bytes {} pkt, dropped {}, overlimits {}, backlog {}b {}p",
                        qdisc.kind,
                        qdisc.handle,
                        qdisc.sent_bytes,
                        qdisc.sent_packets,
                        qdisc.dropped,
                        qdisc.overlimits,
                        qdisc.backlog_bytes,
                        qdisc.backlog_packets
                    );
                }
            }
            Ok(())
        }
        Command::Status => {
            let snapshot = controller.status()?;
            let text = serde_json::to_string_pretty(&snapshot).wrap_err("Failed to render snapshot")?;
            println!("{}", text);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from([
            "topoctl",
            "--config",
            "lab.yaml",
            "add-link",
            "r1",
            "10.0.1.1",
            "r2",
            "10.0.1.2",
            "10mbit/32kb/5ms",
        ]);

        assert_eq!(args.config, Some(PathBuf::from("lab.yaml")));
        assert!(!args.dry_run);
        match args.command {
            Command::AddLink { a, b_ip, params, .. } => {
                assert_eq!(a, "r1");
                assert_eq!(b_ip, Ipv4Addr::new(10, 0, 1, 2));
                assert_eq!(params.bandwidth(), 10.0);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(Args::try_parse_from(["topoctl", "limit", "r1", "0/32/5"]).is_err());
        assert!(Args::try_parse_from(["topoctl", "add-link", "r1", "10.0.1.1", "r2", "bad-ip", "1/1/1"]).is_err());
    }

    #[test]
    fn test_interrupt_cancels_token() {
        let cancel = CancelToken::new();
        cancel_on_interrupt(&cancel).unwrap();
        assert!(!cancel.is_cancelled());

        signal_hook::low_level::raise(SIGINT).unwrap();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_dry_run_and_state() {
        let args = Args::parse_from(["topoctl", "--dry-run", "--state", "s.json", "remove-link", "r1-r2"]);
        assert!(args.dry_run);
        assert_eq!(args.state, Some(PathBuf::from("s.json")));
        assert!(matches!(args.command, Command::RemoveLink { id } if id == "r1-r2"));
    }
}
