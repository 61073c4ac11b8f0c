use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::{DHCP_CONF_ROOT, USERDATA_ROOT};

/// Well-known metadata service address VMs talk to.
pub const METADATA_IP: &str = "169.254.169.254";

/// Bridge connecting every namespace's metadata side to the host.
pub const CONNECT_ALL_NETNS_BR_NAME: &str = "br_conn_all_ns";
pub const CONNECT_ALL_NETNS_BR_OUTER_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 64, 1);
pub const CONNECT_ALL_NETNS_BR_INNER_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 64, 2);
/// Connector subnet mask bits; a /18 leaves 16381 usable namespace addresses.
pub const CONNECT_ALL_NETNS_MASK_BITS: u8 = 18;
/// Highest namespace index representable inside the connector /18.
pub const CONNECT_ALL_NETNS_MAX_INDEX: u32 = 16381;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root of per-namespace dnsmasq directories.
    pub dhcp_conf_root: PathBuf,
    /// Root of per-namespace userdata/metadata directories.
    pub userdata_root: PathBuf,
    pub dnsmasq_bin: PathBuf,
    pub lighttpd_bin: PathBuf,
    /// Consecutive SIGHUP reloads allowed before a full restart is forced.
    pub refresh_threshold: u32,
    /// How long to wait for a (re)started daemon to appear.
    pub readiness_deadline: Duration,
    /// Poll interval while waiting.
    pub readiness_interval: Duration,
    /// Host-wide lock file serializing concurrent rule-table editors.
    pub xtables_lock_path: PathBuf,
    /// Metrics push-gateway port the metadata vhost proxies `/metrics/job` to.
    pub pushgateway_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dhcp_conf_root: PathBuf::from(DHCP_CONF_ROOT),
            userdata_root: PathBuf::from(USERDATA_ROOT),
            dnsmasq_bin: PathBuf::from("dnsmasq"),
            lighttpd_bin: PathBuf::from("lighttpd"),
            refresh_threshold: 50,
            readiness_deadline: Duration::from_secs(5),
            readiness_interval: Duration::from_millis(500),
            xtables_lock_path: PathBuf::from("/run/xtables.lock"),
            pushgateway_port: 9092,
        }
    }
}
