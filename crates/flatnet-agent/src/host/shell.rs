//! [`HostNetwork`] implemented over external commands.
//!
//! Queries use exit status or parsed stdout; mutations are plain
//! invocations. Rule specs are whitespace-tokenized exactly as they would
//! appear in `ebtables-save`/`iptables-save` output, so existence probes and
//! re-applied rules always agree on spelling.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::command::{CommandError, Scope, exec, exec_ignore_errors, exec_status};
use crate::error::{AgentError, Result};

use super::{EbTable, HostNetwork, IpFamily};

pub struct ShellHost;

impl IpFamily {
    fn bin(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn save_bin(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables-save",
            IpFamily::V6 => "ip6tables-save",
        }
    }
}

/// Whether `word` appears as a whitespace token, also matching a token that
/// carries a `/prefix` suffix (`169.254.169.254` matches `169.254.169.254/32`).
fn has_word(text: &str, word: &str) -> bool {
    text.split_whitespace()
        .any(|t| t == word || t.split('/').next() == Some(word))
}

/// Parse one `ip netns list-id` line, e.g.
/// `nsid 3 (iproute2 netns name: br_eth0_100_a9c8b011)`.
fn parse_list_id_line(line: &str) -> Option<(u32, Option<String>)> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("nsid") {
        return None;
    }
    let id = tokens.next()?.parse().ok()?;
    let mut name = None;
    let mut tokens = tokens.peekable();
    while let Some(t) = tokens.next() {
        if t == "name:" {
            name = tokens.next().map(|n| n.trim_end_matches(')').to_string());
        }
    }
    Some((id, name))
}

/// Extract the section of an `ebtables-save` dump belonging to one table.
fn table_section(dump: &str, table: EbTable) -> Vec<String> {
    let mut in_section = false;
    let mut out = Vec::new();
    for line in dump.lines() {
        if let Some(stripped) = line.strip_prefix('*') {
            in_section = stripped == table.name();
            continue;
        }
        if in_section && !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

fn split_rule(rule: &str) -> Vec<&str> {
    rule.split_whitespace().collect()
}

/// First globally-scoped IPv4 address in `ip addr` output. Loopback and
/// other host-scoped addresses are not served addresses and never count.
fn first_inet_addr(out: &str) -> Option<String> {
    out.lines()
        .filter(|l| !l.contains("scope host"))
        .filter_map(|l| {
            let mut tokens = l.split_whitespace();
            (tokens.next() == Some("inet"))
                .then(|| tokens.next())
                .flatten()
                .and_then(|cidr| cidr.split('/').next())
        })
        .find(|a| !a.starts_with("127."))
        .map(str::to_string)
}

impl ShellHost {
    async fn eb(&self, table: EbTable, args: &[&str]) -> Result<()> {
        let mut full = vec!["-t", table.name()];
        full.extend_from_slice(args);
        exec("ebtables", &full, Scope::Host).await?;
        Ok(())
    }

    async fn eb_section(&self, table: EbTable) -> Result<Vec<String>> {
        let dump = exec("ebtables-save", &[], Scope::Host).await?;
        Ok(table_section(&dump, table))
    }

    async fn ipt(&self, family: IpFamily, table: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["-w", "-t", table];
        full.extend_from_slice(args);
        exec(family.bin(), &full, Scope::Host).await?;
        Ok(())
    }
}

#[async_trait]
impl HostNetwork for ShellHost {
    async fn netns_id(&self, name: &str) -> Result<Option<u32>> {
        let out = exec("ip", &["netns", "list-id"], Scope::Host).await?;
        Ok(out.lines().filter_map(parse_list_id_line).find_map(|(id, n)| {
            (n.as_deref() == Some(name)).then_some(id)
        }))
    }

    async fn max_netns_id(&self) -> Result<Option<u32>> {
        let out = exec("ip", &["netns", "list-id"], Scope::Host).await?;
        Ok(out
            .lines()
            .filter_map(parse_list_id_line)
            .map(|(id, _)| id)
            .max())
    }

    async fn netns_exists(&self, name: &str) -> Result<bool> {
        Ok(exec_status("ip", &["link", "show"], Scope::Netns(name)).await)
    }

    async fn create_netns(&self, name: &str, id: u32) -> Result<()> {
        exec("ip", &["netns", "add", name], Scope::Host).await?;
        let id = id.to_string();
        exec("ip", &["netns", "set", name, &id], Scope::Host).await?;
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<()> {
        exec("ip", &["netns", "del", name], Scope::Host).await?;
        Ok(())
    }

    async fn link_exists(&self, dev: &str) -> Result<bool> {
        Ok(exec_status("ip", &["link", "show", "dev", dev], Scope::Host).await)
    }

    async fn ns_link_exists(&self, ns: &str, dev: &str) -> Result<bool> {
        Ok(exec_status("ip", &["link", "show", "dev", dev], Scope::Netns(ns)).await)
    }

    async fn create_veth(&self, dev: &str, peer: &str) -> Result<()> {
        exec(
            "ip",
            &["link", "add", dev, "type", "veth", "peer", "name", peer],
            Scope::Host,
        )
        .await?;
        Ok(())
    }

    async fn delete_link(&self, dev: &str) {
        exec_ignore_errors("ip", &["link", "del", dev], Scope::Host).await;
    }

    async fn link_up(&self, dev: &str) -> Result<()> {
        exec("ip", &["link", "set", dev, "up"], Scope::Host).await?;
        Ok(())
    }

    async fn ns_link_up(&self, ns: &str, dev: &str) -> Result<()> {
        exec("ip", &["link", "set", dev, "up"], Scope::Netns(ns)).await?;
        Ok(())
    }

    async fn move_link_to_netns(&self, dev: &str, ns: &str) -> Result<()> {
        exec("ip", &["link", "set", dev, "netns", ns], Scope::Host).await?;
        Ok(())
    }

    async fn ns_link_mac(&self, ns: &str, dev: &str) -> Result<String> {
        let out = exec("ip", &["link", "show", dev], Scope::Netns(ns)).await?;
        let mut tokens = out.split_whitespace();
        while let Some(t) = tokens.next() {
            if t == "link/ether" {
                if let Some(mac) = tokens.next() {
                    return Ok(mac.to_string());
                }
            }
        }
        Err(AgentError::Command(CommandError {
            command: format!("ip netns exec {ns} ip link show {dev}"),
            detail: "no link/ether address in output".to_string(),
        }))
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        exec("brctl", &["addbr", name], Scope::Host).await?;
        exec("brctl", &["setfd", name, "0"], Scope::Host).await?;
        exec("brctl", &["stp", name, "off"], Scope::Host).await?;
        Ok(())
    }

    async fn bridge_has_port(&self, bridge: &str, dev: &str) -> Result<bool> {
        let out = exec("brctl", &["show", bridge], Scope::Host).await?;
        Ok(has_word(&out, dev))
    }

    async fn add_bridge_port(&self, bridge: &str, dev: &str) -> Result<()> {
        exec("brctl", &["addif", bridge, dev], Scope::Host).await?;
        Ok(())
    }

    async fn dev_has_addr(&self, dev: &str, cidr: &str) -> Result<bool> {
        let out = exec("ip", &["addr", "show", dev], Scope::Host).await?;
        Ok(has_word(&out, cidr))
    }

    async fn add_dev_addr(&self, dev: &str, cidr: &str) -> Result<()> {
        exec("ip", &["addr", "add", cidr, "dev", dev], Scope::Host).await?;
        Ok(())
    }

    async fn ns_has_addr(&self, ns: &str, addr: &str) -> Result<bool> {
        let out = exec("ip", &["addr"], Scope::Netns(ns)).await?;
        Ok(has_word(&out, addr))
    }

    async fn ns_dev_has_addr(&self, ns: &str, dev: &str, addr: &str) -> Result<bool> {
        let out = exec("ip", &["addr", "show", dev], Scope::Netns(ns)).await?;
        Ok(has_word(&out, addr))
    }

    async fn ns_flush_dev_addrs(&self, ns: &str, dev: &str) -> Result<()> {
        exec("ip", &["addr", "flush", "dev", dev], Scope::Netns(ns)).await?;
        Ok(())
    }

    async fn ns_add_addr(&self, ns: &str, dev: &str, cidr: &str) -> Result<()> {
        exec("ip", &["addr", "add", cidr, "dev", dev], Scope::Netns(ns)).await?;
        Ok(())
    }

    async fn ns_first_inet_addr(&self, ns: &str) -> Result<Option<String>> {
        let out = exec("ip", &["addr"], Scope::Netns(ns)).await?;
        Ok(first_inet_addr(&out))
    }

    async fn ns_dev_with_addr(&self, ns: &str, addr: &str) -> Result<Option<String>> {
        let out = exec("ip", &["addr"], Scope::Netns(ns)).await?;
        for line in out.lines() {
            if has_word(line, addr) {
                return Ok(line.split_whitespace().last().map(String::from));
            }
        }
        Ok(None)
    }

    async fn ns_route_count(&self, ns: &str) -> Result<usize> {
        let out = exec("ip", &["route"], Scope::Netns(ns)).await?;
        Ok(out.lines().filter(|l| !l.trim().is_empty()).count())
    }

    async fn ns_add_default_route(&self, ns: &str, dev: &str) -> Result<()> {
        exec("ip", &["route", "add", "default", "dev", dev], Scope::Netns(ns)).await?;
        Ok(())
    }

    async fn eb_chain_exists(&self, table: EbTable, chain: &str) -> Result<bool> {
        Ok(exec_status("ebtables", &["-t", table.name(), "-L", chain], Scope::Host).await)
    }

    async fn eb_create_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        self.eb(table, &["-N", chain]).await
    }

    async fn eb_flush_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        self.eb(table, &["-F", chain]).await
    }

    async fn eb_delete_chain(&self, table: EbTable, chain: &str) -> Result<()> {
        self.eb(table, &["-X", chain]).await
    }

    async fn eb_rule_exists(&self, table: EbTable, chain: &str, rule: &str) -> Result<bool> {
        let needle = format!("-A {chain} {rule}");
        Ok(self.eb_section(table).await?.iter().any(|l| l == &needle))
    }

    async fn eb_insert_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut args = vec!["-I", chain];
        args.extend(split_rule(rule));
        self.eb(table, &args).await
    }

    async fn eb_append_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut args = vec!["-A", chain];
        args.extend(split_rule(rule));
        self.eb(table, &args).await
    }

    async fn eb_delete_rule(&self, table: EbTable, chain: &str, rule: &str) -> Result<()> {
        let mut args = vec!["-D", chain];
        args.extend(split_rule(rule));
        self.eb(table, &args).await
    }

    async fn eb_chain_rules(&self, table: EbTable, chain: &str) -> Result<Vec<String>> {
        let prefix = format!("-A {chain} ");
        Ok(self
            .eb_section(table)
            .await?
            .into_iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(String::from))
            .collect())
    }

    async fn eb_list_chains(&self, table: EbTable) -> Result<Vec<String>> {
        Ok(self
            .eb_section(table)
            .await?
            .into_iter()
            .filter_map(|l| {
                l.strip_prefix(':')
                    .and_then(|r| r.split_whitespace().next().map(String::from))
            })
            .collect())
    }

    async fn eb_flush_table(&self, table: EbTable) -> Result<()> {
        self.eb(table, &["-F"]).await
    }

    async fn eb_save(&self) -> Result<String> {
        exec("ebtables-save", &[], Scope::Host)
            .await
            .map_err(Into::into)
    }

    async fn eb_restore(&self, dump: &str) -> Result<()> {
        trace!(bytes = dump.len(), "ebtables-restore");
        let mut child = tokio::process::Command::new("ebtables-restore")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dump.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Command(CommandError {
                command: "ebtables-restore".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }))
        }
    }

    async fn ipt_chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool> {
        let out = exec(family.save_bin(), &["-t", table], Scope::Host).await?;
        let needle = format!(":{chain} ");
        Ok(out.lines().any(|l| l.starts_with(&needle)))
    }

    async fn ipt_create_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        match self.ipt(family, table, &["-N", chain]).await {
            Ok(()) => Ok(()),
            // another editor created it between our check and this call
            Err(AgentError::Command(e)) if e.detail.contains("Chain already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ipt_flush_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        self.ipt(family, table, &["-F", chain]).await
    }

    async fn ipt_delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        self.ipt(family, table, &["-X", chain]).await
    }

    async fn ipt_rule_exists(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<bool> {
        let mut args = vec!["-w", "-t", table, "-C", chain];
        args.extend(split_rule(rule));
        Ok(exec_status(family.bin(), &args, Scope::Host).await)
    }

    async fn ipt_insert_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut args = vec!["-I", chain];
        args.extend(split_rule(rule));
        self.ipt(family, table, &args).await
    }

    async fn ipt_append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut args = vec!["-A", chain];
        args.extend(split_rule(rule));
        self.ipt(family, table, &args).await
    }

    async fn ipt_delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> Result<()> {
        let mut args = vec!["-D", chain];
        args.extend(split_rule(rule));
        self.ipt(family, table, &args).await
    }

    async fn ipt_chain_names(&self, family: IpFamily, table: &str) -> Result<Vec<String>> {
        let out = exec(family.save_bin(), &["-t", table], Scope::Host).await?;
        Ok(out
            .lines()
            .filter_map(|l| {
                l.strip_prefix(':')
                    .and_then(|r| r.split_whitespace().next().map(String::from))
            })
            .collect())
    }

    async fn find_process_by_config(&self, conf: &Path) -> Result<Option<i32>> {
        let needle = conf.to_string_lossy().into_owned();
        let found = tokio::task::spawn_blocking(move || find_proc(|cmdline| {
            cmdline.iter().any(|arg| arg.contains(&needle))
        }))
        .await
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
        Ok(found)
    }

    async fn kill_process(&self, pid: i32) -> Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        )
        .map_err(|errno| AgentError::Io(std::io::Error::from(errno)))
    }

    async fn signal_reload(&self, pid: i32) -> Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGHUP,
        )
        .map_err(|errno| AgentError::Io(std::io::Error::from(errno)))
    }

    async fn kill_all_by_name(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        let pids = tokio::task::spawn_blocking(move || find_procs(|cmdline| {
            cmdline
                .first()
                .and_then(|c| c.rsplit('/').next())
                .is_some_and(|c| c == name)
        }))
        .await
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
        for pid in pids {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    async fn spawn_daemon(&self, ns: &str, program: &Path, args: &[String]) -> Result<()> {
        let program = program.to_string_lossy().into_owned();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        exec(&program, &arg_refs, Scope::Netns(ns)).await?;
        Ok(())
    }
}

/// Scan `/proc` for the first process whose cmdline matches.
fn find_proc(matches: impl Fn(&[String]) -> bool) -> Option<i32> {
    find_procs(matches).into_iter().next()
}

fn find_procs(matches: impl Fn(&[String]) -> bool) -> Vec<i32> {
    let own_pid = std::process::id() as i32;
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if !cmdline.is_empty() && matches(&cmdline) {
            out.push(pid);
        }
    }
    out
}
