use std::net::Ipv4Addr;

/// IP utility functions for link addressing

/// Prefix length assigned to every link subnet
pub const LINK_PREFIX_LEN: u8 = 24;

/// Return the /24 subnet containing `ip`, as `a.b.c.0/24`
pub fn subnet_of(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!("{}.{}.{}.0/{}", octets[0], octets[1], octets[2], LINK_PREFIX_LEN)
}

/// Check whether `ip` falls inside the /24 containing `anchor`
pub fn in_subnet(anchor: Ipv4Addr, ip: Ipv4Addr) -> bool {
    anchor.octets()[..3] == ip.octets()[..3]
}

/// Format an interface address with the link prefix length
pub fn format_with_prefix(ip: Ipv4Addr) -> String {
    format!("{}/{}", ip, LINK_PREFIX_LEN)
}
