//! Controller configuration.
//!
//! A YAML file with a `controller` section (where state lives, how commands
//! reach the nodes) and an optional `topology` section describing the
//! initial nodes and links pushed by `topoctl init`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ShellExecutor;
use crate::link::LinkParams;
use crate::topology::link_id;
use crate::utils::ip_utils::in_subnet;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyConfig>,
}

/// Settings of the controller process itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Where the topology snapshot is persisted
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Upper bound for every command run on a node
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Wrapper used to run commands inside nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorConfig>,
    /// Lab name, substituted for `{lab}` in the executor arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lab: Option<String>,
}

/// Program and argument template for the shell executor.
///
/// `{node}` and `{command}` are filled in per call, `{lab}` once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Nodes and links created by `init`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Node name to the node's own address
    #[serde(default)]
    pub nodes: BTreeMap<String, Ipv4Addr>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// One configured link, endpoint `a` first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub a: String,
    pub a_ip: Ipv4Addr,
    pub b: String,
    pub b_ip: Ipv4Addr,
    /// Mbit/s
    pub bandwidth: f64,
    /// KB
    pub burst: f64,
    /// ms
    pub latency: f64,
}

impl LinkConfig {
    pub fn id(&self) -> String {
        link_id(&self.a, &self.b)
    }

    pub fn params(&self) -> Result<LinkParams, ValidationError> {
        LinkParams::new(self.bandwidth, self.burst, self.latency)
            .map_err(|e| ValidationError::InvalidTopology(format!("link {}: {}", self.id(), e)))
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid controller configuration: {0}")]
    InvalidController(String),
    #[error("Invalid topology configuration: {0}")]
    InvalidTopology(String),
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/topology.json")
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            command_timeout: default_command_timeout(),
            executor: None,
            lab: None,
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.controller.validate()?;
        if let Some(topology) = &self.topology {
            topology.validate()?;
        }
        Ok(())
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.state_path.as_os_str().is_empty() {
            return Err(ValidationError::InvalidController(
                "state_path cannot be empty".to_string(),
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(ValidationError::InvalidController(
                "command_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(executor) = &self.executor {
            if executor.program.trim().is_empty() {
                return Err(ValidationError::InvalidController(
                    "executor program cannot be empty".to_string(),
                ));
            }
            if !executor.args.iter().any(|arg| arg.contains("{command}")) {
                return Err(ValidationError::InvalidController(
                    "executor args must contain a {command} placeholder".to_string(),
                ));
            }
            if self.lab.is_none() && executor.args.iter().any(|arg| arg.contains("{lab}")) {
                return Err(ValidationError::InvalidController(
                    "executor args use {lab} but no lab is configured".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the shell executor described by this section, running commands
    /// in network namespaces when no wrapper is configured.
    pub fn shell_executor(&self) -> ShellExecutor {
        let Some(executor) = &self.executor else {
            return ShellExecutor::netns();
        };
        let lab = self.lab.as_deref().unwrap_or_default();
        let args = executor
            .args
            .iter()
            .map(|arg| arg.replace("{lab}", lab))
            .collect();
        ShellExecutor::new(executor.program.clone(), args)
    }
}

impl TopologyConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = self.nodes.keys().find(|name| name.trim().is_empty()) {
            return Err(ValidationError::InvalidTopology(format!(
                "node name {:?} cannot be empty",
                name
            )));
        }

        let mut ids = BTreeSet::new();
        for link in &self.links {
            let id = link.id();
            if link.a.trim().is_empty() || link.b.trim().is_empty() {
                return Err(ValidationError::InvalidTopology(format!(
                    "link {} has an empty endpoint name",
                    id
                )));
            }
            if link.a == link.b {
                return Err(ValidationError::InvalidTopology(format!(
                    "link {} connects {} to itself",
                    id, link.a
                )));
            }
            if !ids.insert(id.clone()) {
                return Err(ValidationError::InvalidTopology(format!(
                    "link {} is declared twice",
                    id
                )));
            }
            if link.a_ip == link.b_ip || !in_subnet(link.a_ip, link.b_ip) {
                return Err(ValidationError::InvalidTopology(format!(
                    "link {}: {} and {} must be distinct addresses in one /24",
                    id, link.a_ip, link.b_ip
                )));
            }
            link.params()?;
        }

        Ok(())
    }
}
