//! Operation entry points.
//!
//! Each public method implements one orchestrator command end to end:
//! validate the batch, converge kernel and filesystem state through the
//! reconcilers, then kick the affected daemon. Cross-request state (VM
//! membership, refresh budgets) lives in [`ReconcilerState`] behind the
//! named locks; nothing else is remembered between calls.

use std::collections::BTreeMap;

use flatnet_api::{
    AgentReply, ApplyDhcpCmd, ApplyUserdataCmd, BatchApplyUserdataCmd, CleanupUserdataCmd,
    ConnectCmd, DeleteNamespaceCmd, DhcpBinding, PrepareDhcpCmd, ReleaseDhcpCmd,
    ReleaseUserdataCmd, RemoveForwardDnsCmd, ResetDefaultGatewayCmd, UserdataBinding,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::addr::{ipv4_network_cidr, link_local_from_mac, netmask_to_prefix};
use crate::config::{AgentConfig, METADATA_IP};
use crate::dhcp::{DhcpConfigReconciler, SyncOutcome};
use crate::error::{AgentError, Result};
use crate::host::{EbTable, HostNetwork};
use crate::isolation::{IsolationRuleManager, UserdataChainSpec};
use crate::locks::{AgentLocks, XtablesLock};
use crate::names::{
    ebtables_mac, inner_dev, l3_uuid_from_namespace, outer_dev, phy_dev_from_bridge,
};
use crate::paths::{DhcpPaths, UserdataPaths};
use crate::state::ReconcilerState;
use crate::supervisor::{DaemonSpec, ProcessSupervisor};
use crate::userdata::UserdataConfigReconciler;
use crate::wiring::NamespaceWirer;

/// Turn an operation result into the wire reply, logging failures.
pub fn reply(result: Result<()>) -> AgentReply {
    match result {
        Ok(()) => AgentReply::ok(),
        Err(e) => {
            error!(error = %e, "operation failed");
            AgentReply::fail(e.to_string())
        }
    }
}

pub struct NetworkAgent<H: HostNetwork> {
    host: H,
    config: AgentConfig,
    locks: AgentLocks,
    xtables: XtablesLock,
    state: Mutex<ReconcilerState>,
}

impl<H: HostNetwork> NetworkAgent<H> {
    pub fn new(host: H, config: AgentConfig) -> Self {
        let xtables = XtablesLock::new(&config.xtables_lock_path);
        Self {
            host,
            config,
            locks: AgentLocks::default(),
            xtables,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    // ---- helpers ----

    fn wirer(&self) -> NamespaceWirer<'_, H> {
        NamespaceWirer::new(&self.host)
    }

    fn isolation(&self) -> IsolationRuleManager<'_, H> {
        IsolationRuleManager::new(&self.host, &self.xtables)
    }

    fn dhcp(&self) -> DhcpConfigReconciler<'_> {
        DhcpConfigReconciler::new(&self.config)
    }

    fn userdata(&self) -> UserdataConfigReconciler<'_, H> {
        UserdataConfigReconciler::new(&self.host, &self.config)
    }

    fn supervisor(&self) -> ProcessSupervisor<'_, H> {
        ProcessSupervisor::new(&self.host, &self.config)
    }

    fn dnsmasq_spec(&self, namespace: &str) -> DaemonSpec {
        let conf = DhcpPaths::new(&self.config.dhcp_conf_root, namespace).conf();
        DaemonSpec {
            name: "dnsmasq",
            program: self.config.dnsmasq_bin.clone(),
            namespace: namespace.to_string(),
            args: vec![format!("--conf-file={}", conf.display())],
            conf,
        }
    }

    fn lighttpd_spec(&self, namespace: &str) -> DaemonSpec {
        let conf = UserdataPaths::new(&self.config.userdata_root, namespace).conf();
        DaemonSpec {
            name: "lighttpd",
            program: self.config.lighttpd_bin.clone(),
            namespace: namespace.to_string(),
            args: vec!["-f".to_string(), conf.display().to_string()],
            conf,
        }
    }

    /// Apply a file-sync outcome to dnsmasq. Reloads are budgeted: dnsmasq
    /// leaks a little memory per SIGHUP, so after `refresh_threshold`
    /// consecutive reloads the daemon is restarted instead.
    async fn kick_dnsmasq(&self, namespace: &str, outcome: SyncOutcome) -> Result<()> {
        let spec = self.dnsmasq_spec(namespace);
        let sup = self.supervisor();
        match outcome {
            SyncOutcome::Unchanged => {
                if sup.pid(&spec.conf).await?.is_none() {
                    sup.restart(&spec).await?;
                }
            }
            SyncOutcome::Restart => {
                sup.restart(&spec).await?;
                self.state.lock().await.reset_refresh(namespace);
            }
            SyncOutcome::Refresh => match sup.pid(&spec.conf).await? {
                None => {
                    sup.restart(&spec).await?;
                    self.state.lock().await.reset_refresh(namespace);
                }
                Some(pid) => {
                    let count = self.state.lock().await.count_refresh(namespace);
                    if count > self.config.refresh_threshold {
                        info!(namespace, count, "reload budget exhausted, restarting");
                        sup.restart(&spec).await?;
                        self.state.lock().await.reset_refresh(namespace);
                    } else {
                        sup.reload("dnsmasq", pid).await?;
                    }
                }
            },
        }
        Ok(())
    }

    fn group_by_namespace(bindings: &[DhcpBinding]) -> BTreeMap<String, Vec<DhcpBinding>> {
        let mut groups: BTreeMap<String, Vec<DhcpBinding>> = BTreeMap::new();
        for b in bindings {
            groups.entry(b.namespace_name.clone()).or_default().push(b.clone());
        }
        groups
    }

    fn validate_dhcp_group(namespace: &str, group: &[DhcpBinding]) -> Result<()> {
        let Some(first) = group.first() else {
            return Ok(());
        };
        for b in group {
            if b.bridge_name != first.bridge_name {
                return Err(AgentError::InputInconsistency {
                    namespace: namespace.to_string(),
                    detail: format!(
                        "bindings disagree on bridge: {} vs {}",
                        first.bridge_name, b.bridge_name
                    ),
                });
            }
        }
        Ok(())
    }

    // ---- DHCP operations ----

    /// Stand up (or converge) a namespace's DHCP environment.
    pub async fn prepare_dhcp(&self, cmd: &PrepareDhcpCmd) -> Result<()> {
        let _guard = self.locks.dhcp_prepare.lock().await;
        let ns = &cmd.namespace_name;
        let mut id = self.wirer().ensure_namespace(ns).await?;

        // A namespace left over from a previous L3 configuration carries the
        // old server address; rebuilding from scratch is the only safe move.
        if cmd.ip_version == 4 {
            if let (Some(server), Some(old)) = (
                cmd.dhcp_server_ip.as_deref(),
                self.host.ns_first_inet_addr(ns).await?,
            ) {
                if old != server {
                    warn!(namespace = %ns, old, new = server, "server IP changed, recreating namespace");
                    self.isolation().remove_dhcp(ns, Some(&old)).await?;
                    self.host.delete_netns(ns).await?;
                    id = self.wirer().ensure_namespace(ns).await?;
                }
            }
        }

        let (outer, inner) = (outer_dev(id), inner_dev(id));
        self.wirer()
            .ensure_veth_pair(ns, &cmd.bridge_name, &outer, &inner)
            .await?;

        let Some(server) = cmd.dhcp_server_ip.as_deref() else {
            return Ok(());
        };
        let phy_dev = phy_dev_from_bridge(&cmd.bridge_name);

        if cmd.ip_version == 6 {
            let prefix = cmd.prefix_len.unwrap_or(64);
            self.wirer().ensure_addr(ns, &inner, server, prefix).await?;
            let mac = self.host.ns_link_mac(ns, &inner).await?;
            let link_local = link_local_from_mac(&mac)?.to_string();
            self.wirer().ensure_addr(ns, &inner, &link_local, 64).await?;
            self.isolation()
                .apply_dhcp6(ns, &phy_dev, server, &link_local)
                .await?;
        } else {
            let prefix = match cmd.dhcp_netmask.as_deref() {
                Some(netmask) => netmask_to_prefix(netmask)?,
                None => 24,
            };
            self.wirer()
                .ensure_exclusive_addr(ns, &inner, server, prefix)
                .await?;
            self.isolation().apply_dhcp4(server, &phy_dev).await?;
        }
        Ok(())
    }

    /// Converge lease files for a batch of bindings and nudge the daemons.
    pub async fn apply_dhcp(&self, cmd: &ApplyDhcpCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        let groups = Self::group_by_namespace(&cmd.dhcp);
        for (ns, group) in &groups {
            Self::validate_dhcp_group(ns, group)?;
        }
        for (ns, group) in groups {
            let id = self.wirer().ensure_namespace(&ns).await?;
            if let Some(first) = group.first() {
                self.wirer()
                    .ensure_veth_pair(&ns, &first.bridge_name, &outer_dev(id), &inner_dev(id))
                    .await?;
            }
            let outcome = self
                .dhcp()
                .sync(&ns, &inner_dev(id), &group, cmd.rebuild)
                .await?;
            self.kick_dnsmasq(&ns, outcome).await?;
        }
        Ok(())
    }

    /// Scrub released bindings and restart the daemons that served them.
    /// A release must take effect even if the VM is gone mid-lease, so the
    /// daemon is restarted rather than reloaded.
    pub async fn release_dhcp(&self, cmd: &ReleaseDhcpCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        for (ns, group) in Self::group_by_namespace(&cmd.dhcp) {
            let outcome = self.dhcp().remove(&ns, &group).await?;
            if outcome != SyncOutcome::Unchanged {
                self.supervisor().restart(&self.dnsmasq_spec(&ns)).await?;
                self.state.lock().await.reset_refresh(&ns);
            }
        }
        Ok(())
    }

    /// Tear down a namespace and everything keyed on it.
    pub async fn delete_namespace(&self, cmd: &DeleteNamespaceCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        let ns = &cmd.namespace_name;
        info!(namespace = %ns, "deleting namespace");

        let dhcp_ip = if self.host.netns_exists(ns).await? {
            self.host.ns_first_inet_addr(ns).await?
        } else {
            None
        };

        let spec = self.dnsmasq_spec(ns);
        self.supervisor().stop("dnsmasq", &spec.conf).await?;
        let dir = DhcpPaths::new(&self.config.dhcp_conf_root, ns).dir().to_path_buf();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.isolation().remove_dhcp(ns, dhcp_ip.as_deref()).await?;
        if self.host.netns_exists(ns).await? {
            self.host.delete_netns(ns).await?;
        }
        self.state.lock().await.reset_refresh(ns);
        Ok(())
    }

    /// Move the router option between MACs, either side optional.
    pub async fn reset_default_gateway(&self, cmd: &ResetDefaultGatewayCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        let mut outcomes: BTreeMap<String, SyncOutcome> = BTreeMap::new();

        if let (Some(ns), Some(mac), Some(gw)) = (
            cmd.namespace_name_of_gateway_to_remove.as_deref(),
            cmd.mac_of_gateway_to_remove.as_deref(),
            cmd.gateway_to_remove.as_deref(),
        ) {
            let o = self.dhcp().remove_gateway(ns, mac, gw).await?;
            outcomes.insert(ns.to_string(), o);
        }
        if let (Some(ns), Some(mac), Some(gw)) = (
            cmd.namespace_name_of_gateway_to_add.as_deref(),
            cmd.mac_of_gateway_to_add.as_deref(),
            cmd.gateway_to_add.as_deref(),
        ) {
            let o = self.dhcp().add_gateway(ns, mac, gw).await?;
            outcomes
                .entry(ns.to_string())
                .and_modify(|prev| *prev = prev.max(o))
                .or_insert(o);
        }

        for (ns, outcome) in outcomes {
            self.kick_dnsmasq(&ns, outcome).await?;
        }
        Ok(())
    }

    // ---- forward DNS ----

    pub async fn set_forward_dns(&self, cmd: &flatnet_api::SetForwardDnsCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        let outcome = self
            .dhcp()
            .set_forward_dns(&cmd.name_space, &cmd.mac, &cmd.dns, &cmd.wrong_dns)
            .await?;
        self.kick_dnsmasq(&cmd.name_space, outcome).await
    }

    pub async fn remove_forward_dns(&self, cmd: &RemoveForwardDnsCmd) -> Result<()> {
        let _guard = self.locks.dnsmasq.lock().await;
        let outcome = self
            .dhcp()
            .remove_forward_dns(&cmd.name_space, &cmd.mac)
            .await?;
        self.kick_dnsmasq(&cmd.name_space, outcome).await
    }

    // ---- userdata operations ----

    fn validate_userdata_group(namespace: &str, group: &[&UserdataBinding]) -> Result<()> {
        let Some(first) = group.first() else {
            return Ok(());
        };
        for b in group {
            if b.bridge_name != first.bridge_name
                || b.dhcp_server_ip != first.dhcp_server_ip
                || b.port != first.port
            {
                return Err(AgentError::InputInconsistency {
                    namespace: namespace.to_string(),
                    detail: "bindings disagree on bridge, server IP, or port".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Converge one namespace's userdata environment for a set of member
    /// bindings, then restart its metadata server. lighttpd re-reads its
    /// config only on start, so restart is the only correct kick.
    async fn converge_userdata_namespace(
        &self,
        namespace: &str,
        group: &[&UserdataBinding],
    ) -> Result<()> {
        let Some(first) = group.first() else {
            return Ok(());
        };
        let id = self.wirer().ensure_namespace(namespace).await?;
        let ud_inner = self.userdata().prepare_connector(namespace, id).await?;
        self.userdata()
            .ensure_metadata_ip(namespace, first.dhcp_server_ip.as_deref(), &ud_inner)
            .await?;

        let meta_dev = self
            .host
            .ns_dev_with_addr(namespace, METADATA_IP)
            .await?
            .unwrap_or_else(|| ud_inner.clone());
        let mac = self.host.ns_link_mac(namespace, &meta_dev).await?;

        for b in group {
            let spec = UserdataChainSpec {
                bridge: b.bridge_name.clone(),
                l3_uuid: b.l3_network_uuid.clone(),
                phy_dev: phy_dev_from_bridge(&b.bridge_name),
                vm_network_cidr: ipv4_network_cidr(&b.vm_ip, &b.netmask)?,
                inner_mac: ebtables_mac(&mac),
                port: b.port,
            };
            self.isolation().apply_userdata(&spec).await?;
            self.userdata().write_vm_tree(b).await?;
            self.state
                .lock()
                .await
                .record_vm_ip(&b.l3_network_uuid, &b.vm_ip);
        }

        let ips = self
            .state
            .lock()
            .await
            .vm_ips(&first.l3_network_uuid)
            .to_vec();
        self.userdata().sync_conf(namespace, first.port, &ips).await?;
        self.supervisor().restart(&self.lighttpd_spec(namespace)).await
    }

    pub async fn apply_userdata(&self, cmd: &ApplyUserdataCmd) -> Result<()> {
        let _guard = self.locks.userdata_prepare.lock().await;
        self.converge_userdata_namespace(&cmd.userdata.namespace_name, &[&cmd.userdata])
            .await
    }

    /// Batch apply, validated before any mutation so a bad batch cannot
    /// leave half the namespaces rewritten.
    pub async fn batch_apply_userdata(&self, cmd: &BatchApplyUserdataCmd) -> Result<()> {
        let _guard = self.locks.userdata_prepare.lock().await;

        let mut groups: BTreeMap<String, Vec<&UserdataBinding>> = BTreeMap::new();
        for b in &cmd.userdata {
            groups.entry(b.namespace_name.clone()).or_default().push(b);
        }
        for (ns, group) in &groups {
            Self::validate_userdata_group(ns, group)?;
        }

        if cmd.rebuild {
            info!("rebuilding all metadata servers");
            self.host.kill_all_by_name("lighttpd").await?;
            let mut state = self.state.lock().await;
            for group in groups.values() {
                for b in group {
                    state.clear_l3(&b.l3_network_uuid);
                }
            }
        }

        for (ns, group) in &groups {
            self.converge_userdata_namespace(ns, group).await?;
        }
        Ok(())
    }

    /// Drop one VM from its namespace's metadata service.
    pub async fn release_userdata(&self, cmd: &ReleaseUserdataCmd) -> Result<()> {
        let _guard = self.locks.userdata_prepare.lock().await;
        let ns = &cmd.namespace_name;
        let l3 = l3_uuid_from_namespace(ns);

        self.userdata().remove_vm_tree(ns, &cmd.vm_ip).await?;
        let ips = {
            let mut state = self.state.lock().await;
            state.remove_vm_ip(l3, &cmd.vm_ip);
            state.vm_ips(l3).to_vec()
        };

        let Some(port) = self.lighttpd_port(ns).await? else {
            return Ok(());
        };
        self.userdata().sync_conf(ns, port, &ips).await?;
        self.supervisor().restart(&self.lighttpd_spec(ns)).await
    }

    /// Tear down a namespace's metadata service entirely.
    pub async fn cleanup_userdata(&self, cmd: &CleanupUserdataCmd) -> Result<()> {
        let _guard = self.locks.userdata_prepare.lock().await;
        info!(namespace = %cmd.namespace_name, "cleaning up userdata service");
        self.isolation()
            .remove_userdata(&cmd.bridge_name, &cmd.l3_network_uuid)
            .await?;
        let spec = self.lighttpd_spec(&cmd.namespace_name);
        self.supervisor().stop("lighttpd", &spec.conf).await?;
        self.userdata().remove_tree(&cmd.namespace_name).await?;
        self.state.lock().await.clear_l3(&cmd.l3_network_uuid);
        Ok(())
    }

    /// The port the namespace's metadata server is configured on, recovered
    /// from its config file.
    async fn lighttpd_port(&self, namespace: &str) -> Result<Option<u16>> {
        let conf = UserdataPaths::new(&self.config.userdata_root, namespace).conf();
        let content = match tokio::fs::read_to_string(&conf).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .find_map(|l| l.strip_prefix("server.port = "))
            .and_then(|p| p.trim().parse().ok()))
    }

    // ---- connect ----

    /// Reset the host rule tables to the libvirt baseline. Per-namespace
    /// chains are rebuilt by the full re-apply the orchestrator sends next;
    /// anything else in the tables is stale state from a previous agent life.
    pub async fn connect(&self, _cmd: &ConnectCmd) -> Result<()> {
        let _xt = self.xtables.lock().await;
        let dump = self.host.eb_save().await?;
        let baseline = libvirt_baseline(&dump);
        self.host.eb_flush_table(EbTable::Filter).await?;
        self.host.eb_flush_table(EbTable::Nat).await?;
        self.host.eb_restore(&baseline).await?;
        *self.state.lock().await = ReconcilerState::default();
        Ok(())
    }
}

/// Filter an ebtables dump down to libvirt's own chains and the rules that
/// feed them, dropping everything this agent (or anything else) added.
pub fn libvirt_baseline(dump: &str) -> String {
    fn is_builtin(chain: &str) -> bool {
        chain.chars().all(|ch| ch.is_ascii_uppercase())
    }
    fn is_libvirt(chain: &str) -> bool {
        chain.starts_with("libvirt") || chain.starts_with("I-") || chain.starts_with("O-")
    }

    let mut out = String::new();
    for line in dump.lines() {
        let keep = if line.starts_with('*') {
            true
        } else if let Some(rest) = line.strip_prefix(':') {
            rest.split_whitespace()
                .next()
                .is_some_and(|c| is_builtin(c) || is_libvirt(c))
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let chain = rest.split_whitespace().next().unwrap_or("");
            let target = rest
                .split_whitespace()
                .skip_while(|w| *w != "-j")
                .nth(1)
                .unwrap_or("");
            // libvirt's internal rules, and builtin splices into its chains
            is_libvirt(chain) || (is_builtin(chain) && is_libvirt(target))
        } else {
            false
        };
        if keep {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
