//! Per-namespace traffic isolation rules.
//!
//! Each namespace's DHCP server gets an ebtables chain confining its traffic
//! to the tenant bridge: DHCP packets and server ARP/ND must never cross the
//! physical uplink, or two hosts serving the same L2 segment would answer
//! each other's VMs. Userdata gets a second pair of chains steering metadata
//! traffic into the namespace. Every edit runs under the host-wide xtables
//! lock and re-checks before mutating, so concurrent appliers converge on one
//! copy of each rule.

use tracing::{debug, info};

use crate::addr::solicited_node_multicast;
use crate::config::{CONNECT_ALL_NETNS_BR_OUTER_IP, METADATA_IP};
use crate::error::Result;
use crate::host::{EbTable, HostNetwork, IpFamily};
use crate::locks::XtablesLock;
use crate::names::{
    PORT_CHAIN_PREFIX, dhcp4_chain_name, dhcp6_chain_name, port_chain_name, userdata_chain_name,
};

/// Everything the userdata chains are keyed on.
#[derive(Debug, Clone)]
pub struct UserdataChainSpec {
    pub bridge: String,
    pub l3_uuid: String,
    /// Physical uplink of the bridge.
    pub phy_dev: String,
    /// CIDR of the VM subnet allowed to reach the metadata IP.
    pub vm_network_cidr: String,
    /// MAC of the namespace device answering for the metadata IP, already in
    /// ebtables' compressed spelling.
    pub inner_mac: String,
    /// Metadata HTTP port served inside the namespace.
    pub port: u16,
}

// ---- rule builders (pure, unit-tested) ----

fn dhcp4_rules(phy_dev: &str, dhcp_ip: &str) -> Vec<String> {
    vec![
        format!("-p ARP -i {phy_dev} --arp-ip-dst {dhcp_ip} -j DROP"),
        format!("-p ARP -o {phy_dev} --arp-ip-src {dhcp_ip} -j DROP"),
        format!("-p IPv4 -i {phy_dev} --ip-proto udp --ip-dport 67:68 -j DROP"),
        format!("-p IPv4 -o {phy_dev} --ip-proto udp --ip-sport 67:68 -j DROP"),
        "-j RETURN".to_string(),
    ]
}

fn dhcp6_rules(phy_dev: &str, server_ip: &str, link_local: &str) -> Result<Vec<String>> {
    let mut rules = Vec::new();
    let mut multicast = vec![solicited_node_multicast(server_ip)?.to_string()];
    let ll_multicast = solicited_node_multicast(link_local)?.to_string();
    if !multicast.contains(&ll_multicast) {
        multicast.push(ll_multicast);
    }
    for snm in &multicast {
        rules.push(format!("-p IPv6 -i {phy_dev} --ip6-dst {snm} -j DROP"));
        rules.push(format!("-p IPv6 -o {phy_dev} --ip6-dst {snm} -j DROP"));
    }
    rules.push(format!(
        "-p IPv6 -i {phy_dev} --ip6-proto ipv6-icmp --ip6-icmp-type router-solicitation -j DROP"
    ));
    rules.push(format!(
        "-p IPv6 -o {phy_dev} --ip6-proto ipv6-icmp --ip6-icmp-type router-advertisement -j DROP"
    ));
    rules.push(format!(
        "-p IPv6 -i {phy_dev} --ip6-proto udp --ip6-dport 546:547 -j DROP"
    ));
    rules.push(format!(
        "-p IPv6 -o {phy_dev} --ip6-proto udp --ip6-sport 546:547 -j DROP"
    ));
    rules.push("-j RETURN".to_string());
    Ok(rules)
}

fn userdata_nat_rules(spec: &UserdataChainSpec) -> Vec<String> {
    vec![
        format!(
            "-p IPv4 --ip-src {} --ip-dst {METADATA_IP} -j dnat --to-dst {} --dnat-target ACCEPT",
            spec.vm_network_cidr, spec.inner_mac
        ),
        // the connector gateway must stay invisible to VMs
        format!("-p ARP --arp-ip-dst {CONNECT_ALL_NETNS_BR_OUTER_IP} -j DROP"),
        "-j RETURN".to_string(),
    ]
}

fn userdata_filter_rules(phy_dev: &str) -> Vec<String> {
    vec![
        format!("-i {phy_dev} -j DROP"),
        format!("-o {phy_dev} -j DROP"),
    ]
}

fn port_chain_splice(chain: &str) -> String {
    format!("-d {METADATA_IP}/32 -p tcp -j {chain}")
}

fn port_chain_rule(port: u16) -> String {
    format!(
        "-d {METADATA_IP}/32 -p tcp -m tcp --dport 80 -j DNAT --to-destination {METADATA_IP}:{port}"
    )
}

// ---- manager ----

pub struct IsolationRuleManager<'a, H: HostNetwork + ?Sized> {
    host: &'a H,
    xtables: &'a XtablesLock,
}

impl<'a, H: HostNetwork + ?Sized> IsolationRuleManager<'a, H> {
    pub fn new(host: &'a H, xtables: &'a XtablesLock) -> Self {
        Self { host, xtables }
    }

    async fn ensure_eb_chain(&self, table: EbTable, chain: &str, rules: &[String]) -> Result<()> {
        if !self.host.eb_chain_exists(table, chain).await? {
            self.host.eb_create_chain(table, chain).await?;
        }
        for rule in rules {
            if !self.host.eb_rule_exists(table, chain, rule).await? {
                self.host.eb_append_rule(table, chain, rule).await?;
            }
        }
        Ok(())
    }

    async fn ensure_eb_splice(&self, table: EbTable, builtin: &str, rule: &str) -> Result<()> {
        if !self.host.eb_rule_exists(table, builtin, rule).await? {
            self.host.eb_insert_rule(table, builtin, rule).await?;
        }
        Ok(())
    }

    /// Delete every reference to `chain` from the other chains of its table,
    /// then the chain itself. Tolerates a chain that never existed.
    async fn teardown_eb_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        if !self.host.eb_chain_exists(table, chain).await? {
            return Ok(());
        }
        let target = format!("-j {chain}");
        for other in self.host.eb_list_chains(table).await? {
            if other == chain {
                continue;
            }
            for rule in self.host.eb_chain_rules(table, &other).await? {
                if rule.ends_with(&target) {
                    self.host.eb_delete_rule(table, &other, &rule).await?;
                }
            }
        }
        self.host.eb_flush_chain(table, chain).await?;
        self.host.eb_delete_chain(table, chain).await?;
        Ok(())
    }

    /// Confine a namespace's DHCPv4 server to its bridge.
    pub async fn apply_dhcp4(&self, dhcp_ip: &str, phy_dev: &str) -> Result<()> {
        let _guard = self.xtables.lock().await;
        let chain = dhcp4_chain_name(dhcp_ip);
        debug!(%chain, phy_dev, "applying DHCPv4 isolation");
        self.ensure_eb_chain(EbTable::Filter, &chain, &dhcp4_rules(phy_dev, dhcp_ip))
            .await?;
        self.ensure_eb_splice(EbTable::Filter, "FORWARD", &format!("-j {chain}"))
            .await?;

        // dnsmasq offloads UDP checksums; clients drop the offers without this
        let checksum = "-p udp -m udp --dport 68 -j CHECKSUM --checksum-fill";
        if !self
            .host
            .ipt_rule_exists(IpFamily::V4, "mangle", "POSTROUTING", checksum)
            .await?
        {
            self.host
                .ipt_append_rule(IpFamily::V4, "mangle", "POSTROUTING", checksum)
                .await?;
        }
        Ok(())
    }

    /// Confine a namespace's DHCPv6 server: its solicited-node ND, router
    /// advertisements, and DHCPv6 exchanges stay off the uplink.
    pub async fn apply_dhcp6(
        &self,
        namespace: &str,
        phy_dev: &str,
        server_ip: &str,
        link_local: &str,
    ) -> Result<()> {
        let _guard = self.xtables.lock().await;
        let chain = dhcp6_chain_name(namespace);
        debug!(%chain, phy_dev, "applying DHCPv6 isolation");
        self.ensure_eb_chain(
            EbTable::Filter,
            &chain,
            &dhcp6_rules(phy_dev, server_ip, link_local)?,
        )
        .await?;
        self.ensure_eb_splice(EbTable::Filter, "FORWARD", &format!("-j {chain}"))
            .await?;

        let checksum = "-p udp -m udp --dport 546 -j CHECKSUM --checksum-fill";
        if !self
            .host
            .ipt_rule_exists(IpFamily::V6, "mangle", "POSTROUTING", checksum)
            .await?
        {
            self.host
                .ipt_append_rule(IpFamily::V6, "mangle", "POSTROUTING", checksum)
                .await?;
        }
        Ok(())
    }

    /// Remove a namespace's DHCP isolation chains (both families).
    pub async fn remove_dhcp(&self, namespace: &str, dhcp_ip: Option<&str>) -> Result<()> {
        let _guard = self.xtables.lock().await;
        if let Some(ip) = dhcp_ip {
            self.teardown_eb_chain(EbTable::Filter, &dhcp4_chain_name(ip))
                .await?;
        }
        self.teardown_eb_chain(EbTable::Filter, &dhcp6_chain_name(namespace))
            .await?;
        Ok(())
    }

    /// Steer metadata traffic from the VM subnet into the namespace and keep
    /// it off the uplink.
    pub async fn apply_userdata(&self, spec: &UserdataChainSpec) -> Result<()> {
        let _guard = self.xtables.lock().await;
        let chain = userdata_chain_name(&spec.bridge, &spec.l3_uuid);
        info!(%chain, port = spec.port, "applying userdata redirection");

        self.ensure_eb_chain(EbTable::Nat, &chain, &userdata_nat_rules(spec))
            .await?;
        self.ensure_eb_splice(EbTable::Nat, "PREROUTING", &format!("-j {chain}"))
            .await?;

        self.ensure_eb_chain(EbTable::Filter, &chain, &userdata_filter_rules(&spec.phy_dev))
            .await?;
        self.ensure_eb_splice(
            EbTable::Filter,
            "FORWARD",
            &format!("-p ARP --arp-ip-dst {METADATA_IP} -j {chain}"),
        )
        .await?;

        self.ensure_port_chain(spec.port).await
    }

    /// DNAT port 80 on the metadata IP to the deployment's metadata port.
    /// Only one port is live per host; chains for previous ports are removed
    /// so their DNAT cannot shadow the current one.
    async fn ensure_port_chain(&self, port: u16) -> Result<()> {
        let chain = port_chain_name(port);
        for stale in self.host.ipt_chain_names(IpFamily::V4, "nat").await? {
            if !stale.starts_with(PORT_CHAIN_PREFIX) || stale == chain {
                continue;
            }
            debug!(chain = %stale, "removing stale metadata port chain");
            let splice = port_chain_splice(&stale);
            if self
                .host
                .ipt_rule_exists(IpFamily::V4, "nat", "PREROUTING", &splice)
                .await?
            {
                self.host
                    .ipt_delete_rule(IpFamily::V4, "nat", "PREROUTING", &splice)
                    .await?;
            }
            self.host.ipt_flush_chain(IpFamily::V4, "nat", &stale).await?;
            self.host.ipt_delete_chain(IpFamily::V4, "nat", &stale).await?;
        }

        if !self
            .host
            .ipt_chain_exists(IpFamily::V4, "nat", &chain)
            .await?
        {
            self.host.ipt_create_chain(IpFamily::V4, "nat", &chain).await?;
        }
        let splice = port_chain_splice(&chain);
        if !self
            .host
            .ipt_rule_exists(IpFamily::V4, "nat", "PREROUTING", &splice)
            .await?
        {
            self.host
                .ipt_append_rule(IpFamily::V4, "nat", "PREROUTING", &splice)
                .await?;
        }
        let rule = port_chain_rule(port);
        if !self
            .host
            .ipt_rule_exists(IpFamily::V4, "nat", &chain, &rule)
            .await?
        {
            self.host
                .ipt_append_rule(IpFamily::V4, "nat", &chain, &rule)
                .await?;
        }
        Ok(())
    }

    /// Remove a namespace's userdata chains from both ebtables tables. The
    /// metadata port chain is shared by every namespace and stays.
    pub async fn remove_userdata(&self, bridge: &str, l3_uuid: &str) -> Result<()> {
        let _guard = self.xtables.lock().await;
        let chain = userdata_chain_name(bridge, l3_uuid);
        self.teardown_eb_chain(EbTable::Nat, &chain).await?;
        self.teardown_eb_chain(EbTable::Filter, &chain).await?;
        Ok(())
    }
}
