//! Kernel networking adapter.
//!
//! The reconcilers never run commands directly; they speak to a
//! [`HostNetwork`] of presence queries and conditional mutations. The shell
//! implementation maps each primitive onto `ip`/`brctl`/`ebtables`/
//! `iptables` invocations, the test fake models the same state in memory.
//! Keeping the check-then-act split in the trait is what preserves the
//! idempotency contract: every mutating step has a query the caller must
//! consult first.

mod shell;

#[cfg(test)]
pub mod fake;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use shell::ShellHost;

/// ebtables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EbTable {
    Filter,
    Nat,
}

impl EbTable {
    pub fn name(self) -> &'static str {
        match self {
            EbTable::Filter => "filter",
            EbTable::Nat => "nat",
        }
    }
}

/// iptables address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

#[async_trait]
pub trait HostNetwork: Send + Sync {
    // -- network namespaces --

    /// Numeric id bound to a live namespace name, if any.
    async fn netns_id(&self, name: &str) -> Result<Option<u32>>;
    /// Highest numeric id currently assigned to any live namespace.
    async fn max_netns_id(&self) -> Result<Option<u32>>;
    async fn netns_exists(&self, name: &str) -> Result<bool>;
    async fn create_netns(&self, name: &str, id: u32) -> Result<()>;
    async fn delete_netns(&self, name: &str) -> Result<()>;

    // -- links --

    async fn link_exists(&self, dev: &str) -> Result<bool>;
    async fn ns_link_exists(&self, ns: &str, dev: &str) -> Result<bool>;
    async fn create_veth(&self, dev: &str, peer: &str) -> Result<()>;
    /// Best-effort delete (orphan cleanup); absence is not an error.
    async fn delete_link(&self, dev: &str);
    async fn link_up(&self, dev: &str) -> Result<()>;
    async fn ns_link_up(&self, ns: &str, dev: &str) -> Result<()>;
    async fn move_link_to_netns(&self, dev: &str, ns: &str) -> Result<()>;
    async fn ns_link_mac(&self, ns: &str, dev: &str) -> Result<String>;

    // -- bridges --

    /// Create a bridge with forwarding delay 0 and STP off.
    async fn create_bridge(&self, name: &str) -> Result<()>;
    async fn bridge_has_port(&self, bridge: &str, dev: &str) -> Result<bool>;
    async fn add_bridge_port(&self, bridge: &str, dev: &str) -> Result<()>;

    // -- addresses & routes --

    async fn dev_has_addr(&self, dev: &str, cidr: &str) -> Result<bool>;
    async fn add_dev_addr(&self, dev: &str, cidr: &str) -> Result<()>;
    /// Whether any device in the namespace carries the address.
    async fn ns_has_addr(&self, ns: &str, addr: &str) -> Result<bool>;
    async fn ns_dev_has_addr(&self, ns: &str, dev: &str, addr: &str) -> Result<bool>;
    async fn ns_flush_dev_addrs(&self, ns: &str, dev: &str) -> Result<()>;
    async fn ns_add_addr(&self, ns: &str, dev: &str, cidr: &str) -> Result<()>;
    /// First configured IPv4 address in the namespace (DHCP server IP
    /// re-derivation on prepare).
    async fn ns_first_inet_addr(&self, ns: &str) -> Result<Option<String>>;
    /// Device inside the namespace carrying the given address.
    async fn ns_dev_with_addr(&self, ns: &str, addr: &str) -> Result<Option<String>>;
    async fn ns_route_count(&self, ns: &str) -> Result<usize>;
    async fn ns_add_default_route(&self, ns: &str, dev: &str) -> Result<()>;

    // -- ebtables --

    async fn eb_chain_exists(&self, table: EbTable, chain: &str) -> Result<bool>;
    async fn eb_create_chain(&self, table: EbTable, chain: &str) -> Result<()>;
    async fn eb_flush_chain(&self, table: EbTable, chain: &str) -> Result<()>;
    async fn eb_delete_chain(&self, table: EbTable, chain: &str) -> Result<()>;
    async fn eb_rule_exists(&self, table: EbTable, chain: &str, rule: &str) -> Result<bool>;
    async fn eb_insert_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()>;
    async fn eb_append_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()>;
    async fn eb_delete_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()>;
    /// Rule specs appended to a chain, in save order (teardown walks these
    /// and deletes each one).
    async fn eb_chain_rules(&self, table: EbTable, chain: &str) -> Result<Vec<String>>;
    async fn eb_list_chains(&self, table: EbTable) -> Result<Vec<String>>;
    async fn eb_flush_table(&self, table: EbTable) -> Result<()>;
    /// Full `ebtables-save` dump.
    async fn eb_save(&self) -> Result<String>;
    /// Feed a dump back through `ebtables-restore`.
    async fn eb_restore(&self, dump: &str) -> Result<()>;

    // -- iptables / ip6tables --

    async fn ipt_chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool>;
    /// Create a chain, tolerating a concurrent creator having won the race.
    async fn ipt_create_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()>;
    async fn ipt_flush_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()>;
    async fn ipt_delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()>;
    async fn ipt_rule_exists(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<bool>;
    async fn ipt_insert_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()>;
    async fn ipt_append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()>;
    async fn ipt_delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()>;
    async fn ipt_chain_names(&self, family: IpFamily, table: &str) -> Result<Vec<String>>;

    // -- daemon processes --

    /// Pid of a live process whose command line references the config file.
    async fn find_process_by_config(&self, conf: &Path) -> Result<Option<i32>>;
    async fn kill_process(&self, pid: i32) -> Result<()>;
    /// Lightweight config-reload signal (SIGHUP).
    async fn signal_reload(&self, pid: i32) -> Result<()>;
    /// Kill every process with the given executable name (batch rebuild).
    async fn kill_all_by_name(&self, name: &str) -> Result<()>;
    /// Launch a self-daemonizing program inside a namespace and wait for the
    /// launcher to exit.
    async fn spawn_daemon(&self, ns: &str, program: &Path, args: &[String]) -> Result<()>;
}
