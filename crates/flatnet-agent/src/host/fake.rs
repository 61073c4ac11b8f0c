//! In-memory [`HostNetwork`] for reconciler tests.
//!
//! Models just enough kernel state (namespaces, links, bridges, addresses,
//! rule tables, daemon pids) for the reconcilers' check-then-act sequences to
//! behave like they would on a real host. Built-in chains are pre-seeded so
//! splice rules into FORWARD/PREROUTING work without setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AgentError, Result};

use super::{EbTable, HostNetwork, IpFamily};

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    args: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    netns: BTreeMap<String, u32>,
    host_links: Vec<String>,
    ns_links: BTreeMap<String, Vec<String>>,
    bridges: BTreeMap<String, Vec<String>>,
    host_addrs: BTreeMap<String, Vec<String>>,
    /// ns -> dev -> cidrs, insertion-ordered per device.
    ns_addrs: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    ns_macs: BTreeMap<(String, String), String>,
    ns_routes: BTreeMap<String, Vec<String>>,
    eb: BTreeMap<&'static str, BTreeMap<String, Vec<String>>>,
    ipt: BTreeMap<(&'static str, String), BTreeMap<String, Vec<String>>>,
    processes: BTreeMap<i32, FakeProcess>,
    next_pid: i32,
    reloads: Vec<i32>,
    fail_spawn: bool,
    mac_counter: u8,
}

pub struct FakeHost {
    inner: Mutex<Inner>,
}

fn family_key(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "v4",
        IpFamily::V6 => "v6",
    }
}

fn builtin_ipt_chains(table: &str) -> &'static [&'static str] {
    match table {
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        _ => &["INPUT", "FORWARD", "OUTPUT"],
    }
}

/// Strip a `/prefix` suffix if present.
fn bare_addr(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

impl Default for FakeHost {
    fn default() -> Self {
        let mut inner = Inner {
            next_pid: 1000,
            ..Inner::default()
        };
        for (table, chains) in [
            (EbTable::Filter.name(), ["INPUT", "FORWARD", "OUTPUT"]),
            (EbTable::Nat.name(), ["PREROUTING", "OUTPUT", "POSTROUTING"]),
        ] {
            let entry = inner.eb.entry(table).or_default();
            for chain in chains {
                entry.insert(chain.to_string(), Vec::new());
            }
        }
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `spawn_daemon` call fail.
    pub fn fail_spawns(&self) {
        self.inner.lock().unwrap().fail_spawn = true;
    }

    pub fn set_netns(&self, name: &str, id: u32) {
        self.inner
            .lock()
            .unwrap()
            .netns
            .insert(name.to_string(), id);
    }

    pub fn add_host_link(&self, dev: &str) {
        self.inner.lock().unwrap().host_links.push(dev.to_string());
    }

    pub fn add_bridge(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.bridges.entry(name.to_string()).or_default();
        inner.host_links.push(name.to_string());
    }

    pub fn add_ns_addr(&self, ns: &str, dev: &str, cidr: &str) {
        self.inner
            .lock()
            .unwrap()
            .ns_addrs
            .entry(ns.to_string())
            .or_default()
            .entry(dev.to_string())
            .or_default()
            .push(cidr.to_string());
    }

    pub fn bridge_ports(&self, bridge: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .bridges
            .get(bridge)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rules(&self, table: EbTable, chain: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .eb
            .get(table.name())
            .and_then(|t| t.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn ipt_rules(&self, family: IpFamily, table: &str, chain: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .ipt
            .get(&(family_key(family), table.to_string()))
            .and_then(|t| t.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn process_count(&self) -> usize {
        self.inner.lock().unwrap().processes.len()
    }

    pub fn reload_count(&self) -> usize {
        self.inner.lock().unwrap().reloads.len()
    }

    fn ipt_table<'a>(
        inner: &'a mut Inner,
        family: IpFamily,
        table: &str,
    ) -> &'a mut BTreeMap<String, Vec<String>> {
        let entry = inner
            .ipt
            .entry((family_key(family), table.to_string()))
            .or_default();
        if entry.is_empty() {
            for chain in builtin_ipt_chains(table) {
                entry.insert((*chain).to_string(), Vec::new());
            }
        }
        entry
    }

    fn missing(what: &str) -> AgentError {
        AgentError::Command(crate::command::CommandError {
            command: "fake".to_string(),
            detail: format!("{what} does not exist"),
        })
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn netns_id(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.inner.lock().unwrap().netns.get(name).copied())
    }

    async fn max_netns_id(&self) -> Result<Option<u32>> {
        Ok(self.inner.lock().unwrap().netns.values().copied().max())
    }

    async fn netns_exists(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().netns.contains_key(name))
    }

    async fn create_netns(&self, name: &str, id: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.netns.insert(name.to_string(), id);
        inner.ns_links.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.netns.remove(name);
        inner.ns_links.remove(name);
        inner.ns_addrs.remove(name);
        inner.ns_routes.remove(name);
        Ok(())
    }

    async fn link_exists(&self, dev: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .host_links
            .iter()
            .any(|l| l == dev))
    }

    async fn ns_link_exists(&self, ns: &str, dev: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_links
            .get(ns)
            .is_some_and(|links| links.iter().any(|l| l == dev)))
    }

    async fn create_veth(&self, dev: &str, peer: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.host_links.push(dev.to_string());
        inner.host_links.push(peer.to_string());
        Ok(())
    }

    async fn delete_link(&self, dev: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.host_links.retain(|l| l != dev);
        for ports in inner.bridges.values_mut() {
            ports.retain(|p| p != dev);
        }
    }

    async fn link_up(&self, _dev: &str) -> Result<()> {
        Ok(())
    }

    async fn ns_link_up(&self, _ns: &str, _dev: &str) -> Result<()> {
        Ok(())
    }

    async fn move_link_to_netns(&self, dev: &str, ns: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.host_links.iter().any(|l| l == dev) {
            return Err(Self::missing(dev));
        }
        inner.host_links.retain(|l| l != dev);
        inner
            .ns_links
            .entry(ns.to_string())
            .or_default()
            .push(dev.to_string());
        Ok(())
    }

    async fn ns_link_mac(&self, ns: &str, dev: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.mac_counter += 1;
        let n = inner.mac_counter;
        Ok(inner
            .ns_macs
            .entry((ns.to_string(), dev.to_string()))
            .or_insert_with(|| format!("52:54:00:00:00:{n:02x}"))
            .clone())
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bridges.entry(name.to_string()).or_default();
        inner.host_links.push(name.to_string());
        Ok(())
    }

    async fn bridge_has_port(&self, bridge: &str, dev: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bridges
            .get(bridge)
            .is_some_and(|ports| ports.iter().any(|p| p == dev)))
    }

    async fn add_bridge_port(&self, bridge: &str, dev: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(ports) = inner.bridges.get_mut(bridge) else {
            return Err(Self::missing(bridge));
        };
        ports.push(dev.to_string());
        Ok(())
    }

    async fn dev_has_addr(&self, dev: &str, cidr: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .host_addrs
            .get(dev)
            .is_some_and(|addrs| addrs.iter().any(|a| a == cidr)))
    }

    async fn add_dev_addr(&self, dev: &str, cidr: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .host_addrs
            .entry(dev.to_string())
            .or_default()
            .push(cidr.to_string());
        Ok(())
    }

    async fn ns_has_addr(&self, ns: &str, addr: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_addrs
            .get(ns)
            .is_some_and(|devs| {
                devs.values()
                    .flatten()
                    .any(|a| a == addr || bare_addr(a) == addr)
            }))
    }

    async fn ns_dev_has_addr(&self, ns: &str, dev: &str, addr: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_addrs
            .get(ns)
            .and_then(|devs| devs.get(dev))
            .is_some_and(|addrs| addrs.iter().any(|a| a == addr || bare_addr(a) == addr)))
    }

    async fn ns_flush_dev_addrs(&self, ns: &str, dev: &str) -> Result<()> {
        if let Some(devs) = self.inner.lock().unwrap().ns_addrs.get_mut(ns) {
            devs.remove(dev);
        }
        Ok(())
    }

    async fn ns_add_addr(&self, ns: &str, dev: &str, cidr: &str) -> Result<()> {
        self.add_ns_addr(ns, dev, cidr);
        Ok(())
    }

    async fn ns_first_inet_addr(&self, ns: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_addrs
            .get(ns)
            .and_then(|devs| {
                devs.values()
                    .flatten()
                    .find(|a| !a.contains(':'))
                    .map(|a| bare_addr(a).to_string())
            }))
    }

    async fn ns_dev_with_addr(&self, ns: &str, addr: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_addrs
            .get(ns)
            .and_then(|devs| {
                devs.iter().find_map(|(dev, addrs)| {
                    addrs
                        .iter()
                        .any(|a| a == addr || bare_addr(a) == addr)
                        .then(|| dev.clone())
                })
            }))
    }

    async fn ns_route_count(&self, ns: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ns_routes
            .get(ns)
            .map_or(0, Vec::len))
    }

    async fn ns_add_default_route(&self, ns: &str, dev: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .ns_routes
            .entry(ns.to_string())
            .or_default()
            .push(format!("default dev {dev}"));
        Ok(())
    }

    async fn eb_chain_exists(&self, table: EbTable, chain: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .eb
            .get(table.name())
            .is_some_and(|t| t.contains_key(chain)))
    }

    async fn eb_create_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .eb
            .entry(table.name())
            .or_default()
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    async fn eb_flush_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .eb
            .entry(table.name())
            .or_default()
            .get_mut(chain)
        {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn eb_delete_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.eb.entry(table.name()).or_default().remove(chain) {
            Some(_) => Ok(()),
            None => Err(Self::missing(chain)),
        }
    }

    async fn eb_rule_exists(&self, table: EbTable, chain: &str, rule: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .eb
            .get(table.name())
            .and_then(|t| t.get(chain))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    async fn eb_insert_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.eb.entry(table.name()).or_default().get_mut(chain) {
            Some(rules) => {
                rules.insert(0, rule.to_string());
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn eb_append_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.eb.entry(table.name()).or_default().get_mut(chain) {
            Some(rules) => {
                rules.push(rule.to_string());
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn eb_delete_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.eb.entry(table.name()).or_default().get_mut(chain) {
            Some(rules) => {
                if let Some(pos) = rules.iter().position(|r| r == rule) {
                    rules.remove(pos);
                    Ok(())
                } else {
                    Err(Self::missing(rule))
                }
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn eb_chain_rules(&self, table: EbTable, chain: &str) -> Result<Vec<String>> {
        Ok(self.rules(table, chain))
    }

    async fn eb_list_chains(&self, table: EbTable) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .eb
            .get(table.name())
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn eb_flush_table(&self, table: EbTable) -> Result<()> {
        if let Some(t) = self.inner.lock().unwrap().eb.get_mut(table.name()) {
            for rules in t.values_mut() {
                rules.clear();
            }
        }
        Ok(())
    }

    async fn eb_save(&self) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        for (table, chains) in &inner.eb {
            out.push_str(&format!("*{table}\n"));
            for chain in chains.keys() {
                out.push_str(&format!(":{chain} ACCEPT\n"));
            }
            for (chain, rules) in chains {
                for rule in rules {
                    out.push_str(&format!("-A {chain} {rule}\n"));
                }
            }
        }
        Ok(out)
    }

    async fn eb_restore(&self, dump: &str) -> Result<()> {
        let mut eb: BTreeMap<&'static str, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        let mut current: Option<&'static str> = None;
        for line in dump.lines() {
            if let Some(table) = line.strip_prefix('*') {
                current = match table {
                    "filter" => Some(EbTable::Filter.name()),
                    "nat" => Some(EbTable::Nat.name()),
                    _ => None,
                };
            } else if let Some(rest) = line.strip_prefix(':') {
                if let (Some(table), Some(chain)) = (current, rest.split_whitespace().next()) {
                    eb.entry(table)
                        .or_default()
                        .entry(chain.to_string())
                        .or_default();
                }
            } else if let Some(rest) = line.strip_prefix("-A ") {
                if let (Some(table), Some((chain, rule))) = (current, rest.split_once(' ')) {
                    eb.entry(table)
                        .or_default()
                        .entry(chain.to_string())
                        .or_default()
                        .push(rule.to_string());
                }
            }
        }
        self.inner.lock().unwrap().eb = eb;
        Ok(())
    }

    async fn ipt_chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::ipt_table(&mut inner, family, table).contains_key(chain))
    }

    async fn ipt_create_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::ipt_table(&mut inner, family, table)
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    async fn ipt_flush_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match Self::ipt_table(&mut inner, family, table).get_mut(chain) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn ipt_delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match Self::ipt_table(&mut inner, family, table).remove(chain) {
            Some(_) => Ok(()),
            None => Err(Self::missing(chain)),
        }
    }

    async fn ipt_rule_exists(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::ipt_table(&mut inner, family, table)
            .get(chain)
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    async fn ipt_insert_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match Self::ipt_table(&mut inner, family, table).get_mut(chain) {
            Some(rules) => {
                rules.insert(0, rule.to_string());
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn ipt_append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match Self::ipt_table(&mut inner, family, table).get_mut(chain) {
            Some(rules) => {
                rules.push(rule.to_string());
                Ok(())
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn ipt_delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match Self::ipt_table(&mut inner, family, table).get_mut(chain) {
            Some(rules) => {
                if let Some(pos) = rules.iter().position(|r| r == rule) {
                    rules.remove(pos);
                    Ok(())
                } else {
                    Err(Self::missing(rule))
                }
            }
            None => Err(Self::missing(chain)),
        }
    }

    async fn ipt_chain_names(&self, family: IpFamily, table: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::ipt_table(&mut inner, family, table)
            .keys()
            .cloned()
            .collect())
    }

    async fn find_process_by_config(&self, conf: &Path) -> Result<Option<i32>> {
        let needle = conf.to_string_lossy().into_owned();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .processes
            .iter()
            .find(|(_, p)| p.args.iter().any(|a| a.contains(&needle)))
            .map(|(pid, _)| *pid))
    }

    async fn kill_process(&self, pid: i32) -> Result<()> {
        self.inner.lock().unwrap().processes.remove(&pid);
        Ok(())
    }

    async fn signal_reload(&self, pid: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(&pid) {
            return Err(Self::missing("process"));
        }
        inner.reloads.push(pid);
        Ok(())
    }

    async fn kill_all_by_name(&self, name: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .retain(|_, p| p.name != name);
        Ok(())
    }

    async fn spawn_daemon(&self, _ns: &str, program: &Path, args: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_spawn {
            return Err(Self::missing("spawn"));
        }
        let name = PathBuf::from(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.processes.insert(
            pid,
            FakeProcess {
                name,
                args: args.to_vec(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_chains_are_preseeded() {
        let host = FakeHost::new();
        assert!(host.eb_chain_exists(EbTable::Filter, "FORWARD").await.unwrap());
        assert!(host.eb_chain_exists(EbTable::Nat, "PREROUTING").await.unwrap());
        assert!(
            host.ipt_chain_exists(IpFamily::V4, "nat", "PREROUTING")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn save_restore_round_trips_rules() {
        let host = FakeHost::new();
        host.eb_create_chain(EbTable::Nat, "TEST").await.unwrap();
        host.eb_append_rule(EbTable::Nat, "TEST", "-p ARP -j DROP")
            .await
            .unwrap();
        let dump = host.eb_save().await.unwrap();

        let other = FakeHost::new();
        other.eb_restore(&dump).await.unwrap();
        assert_eq!(other.rules(EbTable::Nat, "TEST"), ["-p ARP -j DROP"]);
    }

    #[tokio::test]
    async fn spawned_daemons_are_findable_by_config() {
        let host = FakeHost::new();
        host.spawn_daemon(
            "ns",
            Path::new("/usr/sbin/dnsmasq"),
            &["--conf-file=/var/lib/flatnet/dnsmasq/x/dnsmasq.conf".to_string()],
        )
        .await
        .unwrap();
        let pid = host
            .find_process_by_config(Path::new("/var/lib/flatnet/dnsmasq/x/dnsmasq.conf"))
            .await
            .unwrap();
        assert!(pid.is_some());

        host.kill_all_by_name("dnsmasq").await.unwrap();
        assert_eq!(host.process_count(), 0);
    }
}
