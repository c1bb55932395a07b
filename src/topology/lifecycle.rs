//! Link lifecycle: adding and removing links in a snapshot.
//!
//! These functions only touch the graph model. Pushing addresses, shaping and
//! routes to the devices is left to the caller so that the model can be
//! committed even when a device is unreachable.

use std::net::Ipv4Addr;

use log::{debug, info};

use super::types::{link_id, Endpoint, Link, Snapshot};
use crate::error::{ControllerError, Result};
use crate::executor::NodeCommand;
use crate::link::LinkParams;
use crate::routing::RouteCommand;
use crate::utils::ip_utils::{format_with_prefix, in_subnet, subnet_of};

/// Outcome of removing a link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRemoval {
    /// The link as it was stored
    pub link: Link,
    /// Direct routes each endpoint had towards the other endpoint's addresses
    pub withdrawn: Vec<RouteCommand>,
}

/// Add a link between two `(node, ip)` endpoints.
///
/// The link id is `"<a>-<b>"` in the order given. Endpoint nodes that are not
/// known yet are created. Each endpoint gets a fresh interface name and its
/// IP joins the node's IP set. The link subnet is the /24 around `a`'s IP and
/// `b`'s IP must fall inside it. On error the snapshot is left unchanged.
pub fn add_link(
    snapshot: &mut Snapshot,
    a: (&str, Ipv4Addr),
    b: (&str, Ipv4Addr),
    params: LinkParams,
) -> Result<Link> {
    let (node_a, ip_a) = a;
    let (node_b, ip_b) = b;
    let id = link_id(node_a, node_b);

    if snapshot.links.contains_key(&id) {
        return Err(ControllerError::DuplicateLink { link_id: id });
    }
    if node_a == node_b {
        return Err(ControllerError::invalid(format!(
            "link {} connects {} to itself",
            id, node_a
        )));
    }
    if ip_a == ip_b {
        return Err(ControllerError::invalid(format!(
            "link {} uses {} on both endpoints",
            id, ip_a
        )));
    }
    if !in_subnet(ip_a, ip_b) {
        return Err(ControllerError::invalid(format!(
            "{} is outside the link subnet {}",
            ip_b,
            subnet_of(ip_a)
        )));
    }

    let mut next = snapshot.clone();
    for node in [node_a, node_b] {
        if next.declare_node(node, None) {
            debug!("Node {} created by link {}", node, id);
        }
    }

    let interface_a = next.allocate_interface(node_a)?;
    let interface_b = next.allocate_interface(node_b)?;

    for (node, ip) in [(node_a, ip_a), (node_b, ip_b)] {
        if let Some(entry) = next.nodes.get_mut(node) {
            entry.ips.insert(ip);
        }
    }

    let link = Link {
        id: id.clone(),
        subnet: subnet_of(ip_a),
        endpoints: [
            Endpoint {
                node: node_a.to_string(),
                ip: ip_a,
                interface: interface_a,
            },
            Endpoint {
                node: node_b.to_string(),
                ip: ip_b,
                interface: interface_b,
            },
        ],
        params,
    };
    next.links.insert(id, link.clone());
    *snapshot = next;

    info!(
        "Added link {} ({} {} <-> {} {}, {})",
        link.id,
        link.endpoints[0].node,
        link.endpoints[0].interface,
        link.endpoints[1].node,
        link.endpoints[1].interface,
        link.params
    );
    Ok(link)
}

/// Remove a link and list the direct routes it had installed.
///
/// Interface counters are left alone. An endpoint IP is dropped from its
/// node's IP set only when no remaining link uses it and it is not the
/// node's declared address.
pub fn remove_link(snapshot: &mut Snapshot, id: &str) -> Result<LinkRemoval> {
    let link = snapshot
        .links
        .remove(id)
        .ok_or_else(|| ControllerError::LinkNotFound {
            link_id: id.to_string(),
        })?;

    let mut withdrawn = Vec::new();
    for endpoint in &link.endpoints {
        let Some(peer) = link.peer_of(&endpoint.node) else {
            continue;
        };
        if let Some(peer_node) = snapshot.nodes.get(&peer.node) {
            withdrawn.extend(peer_node.ips.iter().map(|ip| RouteCommand::Remove {
                node: endpoint.node.clone(),
                destination_node: peer.node.clone(),
                destination: *ip,
            }));
        }
    }

    for endpoint in &link.endpoints {
        let still_used = snapshot
            .links_of(&endpoint.node)
            .filter_map(|other| other.endpoint_on(&endpoint.node))
            .any(|other| other.ip == endpoint.ip);
        if still_used {
            continue;
        }
        if let Some(node) = snapshot.nodes.get_mut(&endpoint.node) {
            if node.address != Some(endpoint.ip) {
                node.ips.remove(&endpoint.ip);
            }
        }
    }

    info!("Removed link {} ({} routes withdrawn)", link.id, withdrawn.len());
    Ok(LinkRemoval { link, withdrawn })
}

/// Command assigning an endpoint's address on its link interface
pub fn address_command(endpoint: &Endpoint) -> NodeCommand {
    NodeCommand::new(
        &endpoint.node,
        format!(
            "ip address add {} dev {}",
            format_with_prefix(endpoint.ip),
            endpoint.interface
        ),
    )
}
