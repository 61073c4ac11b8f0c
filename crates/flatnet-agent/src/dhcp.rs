//! dnsmasq configuration reconciliation.
//!
//! All lease knowledge lives in three generated files per namespace: the
//! hosts file binds MACs to IPs under a per-MAC tag, the options file hangs
//! DHCP options off those tags, and the addn-hosts file feeds forward DNS.
//! Applying a binding means scrubbing every line the binding could have left
//! behind in a previous shape and appending its current shape, so the files
//! converge no matter what was there before. The outcome tells the caller
//! whether dnsmasq needs a restart (main conf changed) or a refresh (every
//! other apply); releases that change nothing report that too.

use flatnet_api::DhcpBinding;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::names::mac_tag;
use crate::paths::{DhcpPaths, write_if_changed};

/// What the daemon must do to pick up a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    /// Data files may have changed; SIGHUP is enough.
    Refresh,
    /// Main conf changed (or a rebuild was forced); full restart.
    Restart,
}

impl SyncOutcome {
    /// Most invasive of two outcomes.
    pub fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::Restart, _) | (_, Self::Restart) => Self::Restart,
            (Self::Refresh, _) | (_, Self::Refresh) => Self::Refresh,
            _ => Self::Unchanged,
        }
    }
}

// ---- line renderers ----

/// Hostname served for a binding: the declared one, or one derived from the
/// IP on the default network so every VM resolves to something.
fn effective_hostname(b: &DhcpBinding) -> Option<String> {
    match &b.hostname {
        Some(h) if !h.is_empty() => Some(h.clone()),
        _ if b.is_default_l3_network => Some(b.ip.replace(['.', ':'], "-")),
        _ => None,
    }
}

/// One `dhcp-hostsfile` entry. IPv6 addresses are bracketed, leases never
/// expire (the orchestrator owns address lifetime, not the protocol).
pub fn host_line(b: &DhcpBinding) -> String {
    let mut parts = vec![b.mac.clone(), format!("set:{}", mac_tag(&b.mac))];
    if b.ip_version == 6 {
        parts.push(format!("[{}]", b.ip));
    } else {
        parts.push(b.ip.clone());
    }
    if let Some(hostname) = effective_hostname(b) {
        parts.push(hostname);
    }
    parts.push("infinite".to_string());
    parts.join(",")
}

/// `dhcp-optsfile` entries for a binding's tag.
pub fn option_lines(b: &DhcpBinding) -> Vec<String> {
    let tag = mac_tag(&b.mac);
    let mut lines = Vec::new();

    if b.ip_version == 6 {
        if !b.dns.is_empty() {
            let servers: Vec<String> = b.dns.iter().map(|d| format!("[{d}]")).collect();
            lines.push(format!("tag:{tag},option6:dns-server,{}", servers.join(",")));
        }
        if let Some(domain) = &b.dns_domain {
            lines.push(format!("tag:{tag},option6:domain-search,{domain}"));
        }
        return lines;
    }

    if b.is_default_l3_network {
        if let Some(gw) = &b.gateway {
            lines.push(format!("tag:{tag},option:router,{gw}"));
        }
        if !b.dns.is_empty() {
            lines.push(format!("tag:{tag},option:dns-server,{}", b.dns.join(",")));
        }
        if let Some(domain) = &b.dns_domain {
            lines.push(format!("tag:{tag},option:domain-name,{domain}"));
        }
        if !b.host_routes.is_empty() {
            let mut routes: Vec<String> = b
                .host_routes
                .iter()
                .map(|r| format!("{},{}", r.prefix, r.nexthop))
                .collect();
            // option 121 suppresses option 3 in clients, so the default
            // route must ride along explicitly
            if let Some(gw) = &b.gateway {
                routes.push(format!("0.0.0.0/0,{gw}"));
            }
            lines.push(format!(
                "tag:{tag},option:classless-static-route,{}",
                routes.join(",")
            ));
        }
    } else {
        // empty router and dns-server options, so a secondary NIC cannot
        // steal the default route or the resolver
        lines.push(format!("tag:{tag},3"));
        lines.push(format!("tag:{tag},6"));
        if !b.host_routes.is_empty() {
            let routes: Vec<String> = b
                .host_routes
                .iter()
                .map(|r| format!("{},{}", r.prefix, r.nexthop))
                .collect();
            lines.push(format!(
                "tag:{tag},option:classless-static-route,{}",
                routes.join(",")
            ));
        }
    }
    if let Some(netmask) = &b.netmask {
        lines.push(format!("tag:{tag},option:netmask,{netmask}"));
    }
    if let Some(mtu) = b.mtu {
        lines.push(format!("tag:{tag},option:mtu,{mtu}"));
    }
    lines
}

/// `addn-hosts` entry; only the default network names VMs in DNS. Domain
/// qualification is dnsmasq's job via `option:domain-name`.
pub fn dns_line(b: &DhcpBinding) -> Option<String> {
    if !b.is_default_l3_network {
        return None;
    }
    let hostname = effective_hostname(b)?;
    Some(format!("{} {hostname}", b.ip))
}

// ---- line scrubbers ----

fn keep_lines(content: &str, keep: impl Fn(&str) -> bool) -> String {
    join_lines(
        content
            .lines()
            .filter(|l| !l.trim().is_empty() && keep(l))
            .map(String::from)
            .collect(),
    )
}

fn join_lines(lines: Vec<String>) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut s = lines.join("\n");
        s.push('\n');
        s
    }
}

/// Drop every hosts entry the binding's MAC or IP could have left behind.
pub fn scrub_hosts(content: &str, b: &DhcpBinding) -> String {
    let mac_prefix = format!("{},", b.mac);
    let ip = if b.ip_version == 6 {
        format!(",[{}],", b.ip)
    } else {
        format!(",{},", b.ip)
    };
    keep_lines(content, |l| !l.starts_with(&mac_prefix) && !l.contains(&ip))
}

/// Drop every option line hanging off the binding's tag.
pub fn scrub_options(content: &str, mac: &str) -> String {
    let tag_prefix = format!("tag:{},", mac_tag(mac));
    keep_lines(content, |l| !l.starts_with(&tag_prefix))
}

/// Drop the DNS entry for an IP.
pub fn scrub_dns(content: &str, ip: &str) -> String {
    let ip_prefix = format!("{ip} ");
    keep_lines(content, |l| !l.starts_with(&ip_prefix))
}

// ---- conf rendering ----

/// `dhcp-range` stanzas the bindings call for, deduplicated in order.
fn ranges_from_bindings(bindings: &[DhcpBinding]) -> Vec<String> {
    let mut ranges: Vec<String> = Vec::new();
    for b in bindings {
        let range = if b.ip_version == 6 {
            match (&b.first_ip, &b.end_ip, b.prefix_length) {
                (Some(first), Some(end), Some(prefix)) => {
                    format!("dhcp-range={first},{end},static,{prefix},24h")
                }
                _ => continue,
            }
        } else {
            match &b.gateway {
                Some(gw) => format!("dhcp-range={gw},static"),
                None => continue,
            }
        };
        if !ranges.contains(&range) {
            ranges.push(range);
        }
    }
    ranges
}

/// Ranges already served keep being served: a partial apply must not shrink
/// the conf and orphan other tenants' subnets.
fn merge_ranges(existing_conf: Option<&str>, new: Vec<String>) -> Vec<String> {
    let mut ranges: Vec<String> = existing_conf
        .map(|conf| {
            conf.lines()
                .filter(|l| l.starts_with("dhcp-range="))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for range in new {
        if !ranges.contains(&range) {
            ranges.push(range);
        }
    }
    ranges
}

fn render_conf(paths: &DhcpPaths, inner_dev: &str, ranges: &[String]) -> String {
    let mut lines = vec![
        "domain-needed".to_string(),
        "bogus-priv".to_string(),
        "no-hosts".to_string(),
        "dhcp-option=vendor:MSFT,2,1i".to_string(),
        "dhcp-lease-max=65535".to_string(),
        format!("addn-hosts={}", paths.hosts_dns().display()),
        format!("dhcp-hostsfile={}", paths.hosts_dhcp().display()),
        format!("dhcp-optsfile={}", paths.hosts_option().display()),
        format!("log-facility={}", paths.log().display()),
        format!("interface={inner_dev}"),
        "except-interface=lo".to_string(),
        "bind-interfaces".to_string(),
        "leasefile-ro".to_string(),
    ];
    lines.extend(ranges.iter().cloned());
    join_lines(lines)
}

// ---- reconciler ----

pub struct DhcpConfigReconciler<'a> {
    config: &'a AgentConfig,
}

impl<'a> DhcpConfigReconciler<'a> {
    pub fn new(config: &'a AgentConfig) -> Self {
        Self { config }
    }

    fn paths(&self, namespace: &str) -> DhcpPaths {
        DhcpPaths::new(&self.config.dhcp_conf_root, namespace)
    }

    async fn read(path: &std::path::Path) -> Result<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring one namespace's files in line with `bindings`. With `rebuild`
    /// the data files are regenerated from scratch instead of scrubbed
    /// incrementally.
    pub async fn sync(
        &self,
        namespace: &str,
        inner_dev: &str,
        bindings: &[DhcpBinding],
        rebuild: bool,
    ) -> Result<SyncOutcome> {
        let paths = self.paths(namespace);
        paths.ensure().await?;

        let (mut hosts, mut options, mut dns) = if rebuild {
            (String::new(), String::new(), String::new())
        } else {
            (
                Self::read(&paths.hosts_dhcp()).await?,
                Self::read(&paths.hosts_option()).await?,
                Self::read(&paths.hosts_dns()).await?,
            )
        };

        for b in bindings {
            hosts = scrub_hosts(&hosts, b);
            hosts.push_str(&host_line(b));
            hosts.push('\n');

            options = scrub_options(&options, &b.mac);
            for line in option_lines(b) {
                options.push_str(&line);
                options.push('\n');
            }

            dns = scrub_dns(&dns, &b.ip);
            if let Some(line) = dns_line(b) {
                dns.push_str(&line);
                dns.push('\n');
            }
        }

        write_if_changed(&paths.hosts_dhcp(), &hosts).await?;
        write_if_changed(&paths.hosts_option(), &options).await?;
        write_if_changed(&paths.hosts_dns(), &dns).await?;

        let existing_conf = if rebuild {
            None
        } else {
            Some(Self::read(&paths.conf()).await?)
        };
        let ranges = merge_ranges(existing_conf.as_deref(), ranges_from_bindings(bindings));
        let conf = render_conf(&paths, inner_dev, &ranges);
        let conf_changed = write_if_changed(&paths.conf(), &conf).await?;

        // The daemon is signalled on every apply, even when the rendered
        // files come out byte-identical; the diff above only spares the disk
        // writes. Skipping the signal would also skip the refresh counter,
        // and the reload budget must advance with every apply.
        let outcome = if rebuild || conf_changed {
            SyncOutcome::Restart
        } else {
            SyncOutcome::Refresh
        };
        debug!(namespace, ?outcome, bindings = bindings.len(), "dhcp files synced");
        Ok(outcome)
    }

    /// Scrub released bindings out of the files.
    pub async fn remove(&self, namespace: &str, bindings: &[DhcpBinding]) -> Result<SyncOutcome> {
        let paths = self.paths(namespace);
        let mut hosts = Self::read(&paths.hosts_dhcp()).await?;
        let mut options = Self::read(&paths.hosts_option()).await?;
        let mut dns = Self::read(&paths.hosts_dns()).await?;

        for b in bindings {
            hosts = scrub_hosts(&hosts, b);
            options = scrub_options(&options, &b.mac);
            dns = scrub_dns(&dns, &b.ip);
        }

        let mut changed = write_if_changed(&paths.hosts_dhcp(), &hosts).await?;
        changed |= write_if_changed(&paths.hosts_option(), &options).await?;
        changed |= write_if_changed(&paths.hosts_dns(), &dns).await?;
        Ok(if changed {
            SyncOutcome::Refresh
        } else {
            SyncOutcome::Unchanged
        })
    }

    /// Rewrite one tag's option lines in place with an edit function.
    async fn edit_options(
        &self,
        namespace: &str,
        edit: impl FnOnce(String) -> String,
    ) -> Result<SyncOutcome> {
        let paths = self.paths(namespace);
        let options = Self::read(&paths.hosts_option()).await?;
        let edited = edit(options);
        Ok(if write_if_changed(&paths.hosts_option(), &edited).await? {
            SyncOutcome::Refresh
        } else {
            SyncOutcome::Unchanged
        })
    }

    /// Point a VM at an on-host DNS forwarder, scrubbing any previously
    /// pushed (now wrong) servers first.
    pub async fn set_forward_dns(
        &self,
        namespace: &str,
        mac: &str,
        dns: &str,
        wrong_dns: &[String],
    ) -> Result<SyncOutcome> {
        let tag = mac_tag(mac);
        let new_line = format!("tag:{tag},option:dns-server,{dns}");
        let stale: Vec<String> = wrong_dns
            .iter()
            .map(|d| format!("tag:{tag},option:dns-server,{d}"))
            .collect();
        self.edit_options(namespace, move |content| {
            let mut kept = keep_lines(&content, |l| {
                l != new_line.as_str() && !stale.iter().any(|s| l == s)
            });
            kept.push_str(&new_line);
            kept.push('\n');
            kept
        })
        .await
    }

    /// Drop a VM's pushed dns-server option.
    pub async fn remove_forward_dns(&self, namespace: &str, mac: &str) -> Result<SyncOutcome> {
        let prefix = format!("tag:{},option:dns-server,", mac_tag(mac));
        self.edit_options(namespace, move |content| {
            keep_lines(&content, |l| !l.starts_with(&prefix))
        })
        .await
    }

    /// Remove a router option from one MAC's tag.
    pub async fn remove_gateway(
        &self,
        namespace: &str,
        mac: &str,
        gateway: &str,
    ) -> Result<SyncOutcome> {
        let line = format!("tag:{},option:router,{gateway}", mac_tag(mac));
        self.edit_options(namespace, move |content| {
            keep_lines(&content, |l| l != line.as_str())
        })
        .await
    }

    /// Add a router option to one MAC's tag.
    pub async fn add_gateway(
        &self,
        namespace: &str,
        mac: &str,
        gateway: &str,
    ) -> Result<SyncOutcome> {
        let line = format!("tag:{},option:router,{gateway}", mac_tag(mac));
        self.edit_options(namespace, move |content| {
            let mut kept = keep_lines(&content, |l| l != line.as_str());
            kept.push_str(&line);
            kept.push('\n');
            kept
        })
        .await
    }
}
