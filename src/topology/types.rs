//! Topology snapshot types.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};
use crate::link::LinkParams;

/// Prefix of every interface name handed out by the controller
pub const INTERFACE_PREFIX: &str = "eth";

/// Derive a link identifier from its endpoint node identifiers, in order.
pub fn link_id(node_a: &str, node_b: &str) -> String {
    format!("{}-{}", node_a, node_b)
}

/// Parse the index out of an interface name such as `eth3`.
pub fn interface_index(interface: &str) -> Option<u32> {
    interface.strip_prefix(INTERFACE_PREFIX)?.parse().ok()
}

/// A network device known to the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Address given when the device was declared, if any. Never released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    /// Every address the node answers on
    #[serde(default)]
    pub ips: BTreeSet<Ipv4Addr>,
    /// Highest interface index ever allocated on this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interface: Option<u32>,
}

/// One side of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub ip: Ipv4Addr,
    pub interface: String,
}

/// An undirected, shaped connection between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub subnet: String,
    pub endpoints: [Endpoint; 2],
    pub params: LinkParams,
}

impl Link {
    /// The endpoint on `node`, if the link touches it
    pub fn endpoint_on(&self, node: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.node == node)
    }

    /// The endpoint facing away from `node`
    pub fn peer_of(&self, node: &str) -> Option<&Endpoint> {
        match &self.endpoints {
            [a, b] if a.node == node => Some(b),
            [a, b] if b.node == node => Some(a),
            _ => None,
        }
    }

    pub fn touches(&self, node: &str) -> bool {
        self.endpoint_on(node).is_some()
    }
}

/// Complete topology state at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub links: BTreeMap<String, Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn link(&self, id: &str) -> Option<&Link> {
        self.links.get(id)
    }

    /// Declare a device, optionally with its own address.
    ///
    /// Returns true if the node did not exist before.
    pub fn declare_node(&mut self, id: &str, address: Option<Ipv4Addr>) -> bool {
        let created = !self.nodes.contains_key(id);
        let node = self.nodes.entry(id.to_string()).or_default();
        if let Some(address) = address {
            node.address = Some(address);
            node.ips.insert(address);
        }
        created
    }

    /// Remove a node that no link references any more.
    pub fn remove_node(&mut self, id: &str) -> Result<Node> {
        if let Some(link) = self.links_of(id).next() {
            return Err(ControllerError::NodeInUse {
                node_id: id.to_string(),
                link_id: link.id.clone(),
            });
        }
        self.nodes.remove(id).ok_or_else(|| ControllerError::UnknownNode {
            node_id: id.to_string(),
        })
    }

    /// Hand out the next interface name of `node_id` and record it.
    ///
    /// Indices only grow, so a name is never reused even after the link that
    /// held it is removed. The caller must persist the snapshot for the
    /// allocation to survive a restart.
    pub fn allocate_interface(&mut self, node_id: &str) -> Result<String> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ControllerError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
        let next = match node.last_interface {
            None => 0,
            Some(last) => last.checked_add(1).ok_or_else(|| {
                ControllerError::invalid(format!("interface space exhausted on {}", node_id))
            })?,
        };
        node.last_interface = Some(next);
        Ok(format!("{}{}", INTERFACE_PREFIX, next))
    }

    /// All links with an endpoint on `node_id`
    pub fn links_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.values().filter(move |link| link.touches(node_id))
    }

    /// Interfaces of `node_id` that currently carry a link
    pub fn interfaces_of(&self, node_id: &str) -> Vec<String> {
        self.links_of(node_id)
            .filter_map(|link| link.endpoint_on(node_id))
            .map(|endpoint| endpoint.interface.clone())
            .collect()
    }

    /// Check the structural invariants a persisted snapshot must hold.
    pub fn validate(&self) -> Result<(), String> {
        let mut interfaces: BTreeSet<(&str, &str)> = BTreeSet::new();
        for (key, link) in &self.links {
            if key != &link.id {
                return Err(format!("link stored under '{}' has id '{}'", key, link.id));
            }
            let [a, b] = &link.endpoints;
            if a.node == b.node {
                return Err(format!("link {} connects {} to itself", link.id, a.node));
            }
            if link.id != link_id(&a.node, &b.node) {
                return Err(format!(
                    "link id '{}' does not match endpoints {} and {}",
                    link.id, a.node, b.node
                ));
            }
            for endpoint in &link.endpoints {
                let node = self.nodes.get(&endpoint.node).ok_or_else(|| {
                    format!("link {} references unknown node {}", link.id, endpoint.node)
                })?;
                if !node.ips.contains(&endpoint.ip) {
                    return Err(format!(
                        "link {} uses {} on {} but the node does not own it",
                        link.id, endpoint.ip, endpoint.node
                    ));
                }
                let index = interface_index(&endpoint.interface).ok_or_else(|| {
                    format!("link {} has malformed interface '{}'", link.id, endpoint.interface)
                })?;
                if node.last_interface.map_or(true, |last| index > last) {
                    return Err(format!(
                        "link {} uses {} on {} beyond the node's interface counter",
                        link.id, endpoint.interface, endpoint.node
                    ));
                }
                if !interfaces.insert((endpoint.node.as_str(), endpoint.interface.as_str())) {
                    return Err(format!(
                        "{} on {} is used by more than one link",
                        endpoint.interface, endpoint.node
                    ));
                }
            }
        }
        Ok(())
    }

    /// Same nodes, links and IP sets, ignoring interface counters and timestamps.
    pub fn same_graph(&self, other: &Snapshot) -> bool {
        self.links == other.links
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|(id, node)| {
                other
                    .nodes
                    .get(id)
                    .map_or(false, |o| o.ips == node.ips && o.address == node.address)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_interface_is_monotonic() {
        let mut snapshot = Snapshot::default();
        snapshot.declare_node("r1", None);

        assert_eq!(snapshot.allocate_interface("r1").unwrap(), "eth0");
        assert_eq!(snapshot.allocate_interface("r1").unwrap(), "eth1");
        assert_eq!(snapshot.node("r1").unwrap().last_interface, Some(1));

        assert!(matches!(
            snapshot.allocate_interface("missing"),
            Err(ControllerError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_declare_node_registers_address() {
        let mut snapshot = Snapshot::default();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(snapshot.declare_node("r1", Some(ip)));
        assert!(!snapshot.declare_node("r1", Some(ip)));

        let node = snapshot.node("r1").unwrap();
        assert_eq!(node.address, Some(ip));
        assert_eq!(node.ips.len(), 1);
    }

    #[test]
    fn test_interface_index() {
        assert_eq!(interface_index("eth0"), Some(0));
        assert_eq!(interface_index("eth12"), Some(12));
        assert_eq!(interface_index("wlan0"), None);
        assert_eq!(interface_index("eth"), None);
    }

    #[test]
    fn test_validate_detects_foreign_ip() {
        let mut snapshot = Snapshot::default();
        snapshot.declare_node("a", None);
        snapshot.declare_node("b", None);
        snapshot.nodes.get_mut("a").unwrap().last_interface = Some(0);
        snapshot.nodes.get_mut("b").unwrap().last_interface = Some(0);
        let link = Link {
            id: link_id("a", "b"),
            subnet: "10.0.0.0/24".to_string(),
            endpoints: [
                Endpoint {
                    node: "a".to_string(),
                    ip: Ipv4Addr::new(10, 0, 0, 1),
                    interface: "eth0".to_string(),
                },
                Endpoint {
                    node: "b".to_string(),
                    ip: Ipv4Addr::new(10, 0, 0, 2),
                    interface: "eth0".to_string(),
                },
            ],
            params: LinkParams::new(10.0, 32.0, 1.0).unwrap(),
        };
        snapshot.links.insert(link.id.clone(), link);

        assert!(snapshot.validate().is_err());

        for (node, ip) in [("a", [10, 0, 0, 1]), ("b", [10, 0, 0, 2])] {
            snapshot.nodes.get_mut(node).unwrap().ips.insert(Ipv4Addr::from(ip));
        }
        assert!(snapshot.validate().is_ok());
    }

    fn endpoint(node: &str, last: u8, interface: &str) -> Endpoint {
        Endpoint {
            node: node.to_string(),
            ip: Ipv4Addr::new(10, 0, last, 1),
            interface: interface.to_string(),
        }
    }

    fn insert_link(snapshot: &mut Snapshot, a: Endpoint, b: Endpoint) {
        for endpoint in [&a, &b] {
            let node = snapshot.nodes.entry(endpoint.node.clone()).or_default();
            node.ips.insert(endpoint.ip);
            node.last_interface = Some(5);
        }
        let link = Link {
            id: link_id(&a.node, &b.node),
            subnet: "10.0.0.0/24".to_string(),
            endpoints: [a, b],
            params: LinkParams::new(10.0, 32.0, 1.0).unwrap(),
        };
        snapshot.links.insert(link.id.clone(), link);
    }

    #[test]
    fn test_validate_rejects_shared_interface() {
        let mut snapshot = Snapshot::default();
        insert_link(&mut snapshot, endpoint("a", 1, "eth0"), endpoint("b", 2, "eth0"));
        insert_link(&mut snapshot, endpoint("a", 3, "eth1"), endpoint("c", 4, "eth0"));
        assert!(snapshot.validate().is_ok());

        insert_link(&mut snapshot, endpoint("d", 5, "eth0"), endpoint("a", 6, "eth1"));
        let err = snapshot.validate().unwrap_err();
        assert!(err.contains("eth1 on a"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_self_link() {
        let mut snapshot = Snapshot::default();
        insert_link(&mut snapshot, endpoint("a", 1, "eth0"), endpoint("a", 2, "eth1"));
        assert!(snapshot.validate().unwrap_err().contains("itself"));
    }

    #[test]
    fn test_remove_node_in_use() {
        let mut snapshot = Snapshot::default();
        snapshot.declare_node("lonely", None);
        assert!(snapshot.remove_node("lonely").is_ok());
        assert!(matches!(
            snapshot.remove_node("lonely"),
            Err(ControllerError::UnknownNode { .. })
        ));
    }
}
