//! Address arithmetic for the reconcilers.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::AgentError;

fn parse_v4(addr: &str) -> Result<Ipv4Addr, AgentError> {
    addr.parse().map_err(|e: std::net::AddrParseError| {
        AgentError::InvalidAddress {
            addr: addr.to_string(),
            detail: e.to_string(),
        }
    })
}

fn parse_v6(addr: &str) -> Result<Ipv6Addr, AgentError> {
    addr.parse().map_err(|e: std::net::AddrParseError| {
        AgentError::InvalidAddress {
            addr: addr.to_string(),
            detail: e.to_string(),
        }
    })
}

/// Convert a dotted-decimal netmask into a prefix length.
pub fn netmask_to_prefix(netmask: &str) -> Result<u8, AgentError> {
    let mask = parse_v4(netmask)?;
    let bits = u32::from(mask);
    // reject non-contiguous masks like 255.0.255.0
    if bits.count_ones() != bits.leading_ones() {
        return Err(AgentError::InvalidAddress {
            addr: netmask.to_string(),
            detail: "netmask is not contiguous".to_string(),
        });
    }
    Ok(bits.count_ones() as u8)
}

/// Network CIDR containing `ip` under `netmask`, e.g.
/// (`192.168.1.10`, `255.255.255.0`) → `192.168.1.0/24`.
pub fn ipv4_network_cidr(ip: &str, netmask: &str) -> Result<String, AgentError> {
    let ip = parse_v4(ip)?;
    let prefix = netmask_to_prefix(netmask)?;
    let mask = u32::from(parse_v4(netmask)?);
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    Ok(format!("{network}/{prefix}"))
}

/// Offset an IPv4 address by `index` (wrapping is a caller bug, the connector
/// capacity check fires long before the /18 wraps).
pub fn offset_v4(base: Ipv4Addr, index: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(index))
}

/// EUI-64 link-local address derived from a MAC, assigned to the inner
/// device so DHCPv6 clients can reach the server.
pub fn link_local_from_mac(mac: &str) -> Result<Ipv6Addr, AgentError> {
    let octets: Vec<u8> = mac
        .split(':')
        .map(|o| u8::from_str_radix(o, 16))
        .collect::<Result<_, _>>()
        .map_err(|e| AgentError::InvalidAddress {
            addr: mac.to_string(),
            detail: e.to_string(),
        })?;
    let [a, b, c, d, e, f] = octets.as_slice() else {
        return Err(AgentError::InvalidAddress {
            addr: mac.to_string(),
            detail: "expected 6 octets".to_string(),
        });
    };
    let eui0 = a ^ 0x02; // flip the universal/local bit
    Ok(Ipv6Addr::from([
        0xfe, 0x80, 0, 0, 0, 0, 0, 0, eui0, *b, *c, 0xff, 0xfe, *d, *e, *f,
    ]))
}

/// Solicited-node multicast address for an IPv6 unicast address
/// (`ff02::1:ffXX:XXXX` from the low 24 bits).
pub fn solicited_node_multicast(addr: &str) -> Result<Ipv6Addr, AgentError> {
    let addr = parse_v6(addr)?;
    let o = addr.octets();
    Ok(Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ]))
}
