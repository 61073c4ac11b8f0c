//! Deterministic device, tag, and chain naming.
//!
//! Everything here is a pure function of the declared inputs so the same
//! request always lands on the same kernel objects, which is what makes the
//! presence-check-then-mutate idiom idempotent.

/// ebtables refuses chain names longer than this.
pub const MAX_CHAIN_NAME_LEN: usize = 31;

/// Physical device carrying a bridge's uplink.
///
/// For VLAN bridges `br_eth0_100` the sub-interface is `eth0.100`; for VXLAN
/// bridges `br_vx_7863` it is `vxlan7863`.
pub fn phy_dev_from_bridge(bridge: &str) -> String {
    let stripped = bridge.strip_prefix("br_").unwrap_or(bridge);
    if let Some(rest) = stripped.strip_prefix("vx") {
        format!("vxlan{}", rest.replace('_', ""))
    } else {
        stripped.replace('_', ".")
    }
}

/// The l3-network uuid is the last `_`-separated token of the namespace name.
pub fn l3_uuid_from_namespace(namespace: &str) -> &str {
    namespace.rsplit('_').next().unwrap_or(namespace)
}

fn truncate(s: &str, len: usize) -> &str {
    s.get(..len).unwrap_or(s)
}

fn last(s: &str, len: usize) -> &str {
    match s.len().checked_sub(len) {
        Some(start) => s.get(start..).unwrap_or(s),
        None => s,
    }
}

/// ebtables filter chain isolating a namespace's DHCPv4 server.
pub fn dhcp4_chain_name(dhcp_ip: &str) -> String {
    format!("ZSTACK-{dhcp_ip}")
}

/// ebtables filter chain isolating a namespace's DHCPv6 server.
pub fn dhcp6_chain_name(namespace: &str) -> String {
    let l3 = l3_uuid_from_namespace(namespace);
    format!("ZSTACK-DHCP6-{}", truncate(l3, 9))
}

/// ebtables chain for userdata redirection, shared by the nat and filter
/// tables. Long bridge names keep their last 12 characters; the 8-character
/// l3-uuid suffix disambiguates bridges that collide after truncation.
pub fn userdata_chain_name(bridge: &str, l3_uuid: &str) -> String {
    format!("USERDATA-{}-{}", last(bridge, 12), truncate(l3_uuid, 8))
}

/// iptables nat chain DNAT-ing the metadata port for one deployment-wide port.
pub fn port_chain_name(port: u16) -> String {
    format!("UD-PORT-{port}")
}

/// Prefix shared by all metadata port chains, for stale-chain discovery.
pub const PORT_CHAIN_PREFIX: &str = "UD-PORT-";

pub fn outer_dev(namespace_id: u32) -> String {
    format!("outer{namespace_id}")
}

pub fn inner_dev(namespace_id: u32) -> String {
    format!("inner{namespace_id}")
}

/// Userdata connector veth ends, derived from the DHCP veth names.
/// `ip link add` caps device names at 15 characters, hence the short prefix.
pub fn userdata_dev(dev: &str) -> String {
    format!("ud_{dev}")
}

/// Recover the numeric namespace index from an `innerN` device name.
pub fn index_from_inner_dev(dev: &str) -> Option<u32> {
    dev.strip_prefix("inner")?.parse().ok()
}

/// dnsmasq tag derived from a MAC: colons stripped.
pub fn mac_tag(mac: &str) -> String {
    mac.replace(':', "")
}

/// ebtables prints MACs with a leading zero elided per octet (`aa:0b` as
/// `aa:b`), so rules must be written that way to match on re-check.
pub fn ebtables_mac(mac: &str) -> String {
    mac.replace(":0", ":")
}
