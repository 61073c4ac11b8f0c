use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default root for per-namespace dnsmasq configuration.
pub const DHCP_CONF_ROOT: &str = "/var/lib/flatnet/dnsmasq";

/// Default root for per-namespace metadata/userdata trees.
pub const USERDATA_ROOT: &str = "/var/lib/flatnet/userdata";

/// Subtree served to VMs without their own metadata entry.
pub const DEFAULT_USERDATA_SUBTREE: &str = "zstack-default";

/// Per-namespace dnsmasq file layout:
/// `<root>/<namespace>/{dnsmasq.conf,hosts.dhcp,hosts.dns,hosts.option,dnsmasq.log}`.
#[derive(Debug, Clone)]
pub struct DhcpPaths {
    dir: PathBuf,
}

impl DhcpPaths {
    pub fn new(root: &Path, namespace: &str) -> Self {
        Self {
            dir: root.join(namespace),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conf(&self) -> PathBuf {
        self.dir.join("dnsmasq.conf")
    }

    /// Per-binding lease lines (`dhcp-hostsfile`).
    pub fn hosts_dhcp(&self) -> PathBuf {
        self.dir.join("hosts.dhcp")
    }

    /// ip-to-hostname lines (`addn-hosts`).
    pub fn hosts_dns(&self) -> PathBuf {
        self.dir.join("hosts.dns")
    }

    /// Tagged option lines (`dhcp-optsfile`).
    pub fn hosts_option(&self) -> PathBuf {
        self.dir.join("hosts.option")
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join("dnsmasq.log")
    }

    /// Create the directory and touch the data files. The main conf is left
    /// alone: its absence is what forces the initial restart decision.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for path in [self.hosts_dhcp(), self.hosts_dns(), self.hosts_option(), self.log()] {
            if !path.exists() {
                tokio::fs::write(&path, b"").await?;
            }
        }
        Ok(())
    }
}

/// Per-namespace metadata server layout:
/// `<root>/<namespace>/{lighttpd.conf,html/...}`.
#[derive(Debug, Clone)]
pub struct UserdataPaths {
    dir: PathBuf,
}

impl UserdataPaths {
    pub fn new(root: &Path, namespace: &str) -> Self {
        Self {
            dir: root.join(namespace),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conf(&self) -> PathBuf {
        self.dir.join("lighttpd.conf")
    }

    pub fn html_root(&self) -> PathBuf {
        self.dir.join("html")
    }

    pub fn default_meta_dir(&self) -> PathBuf {
        self.html_root().join(DEFAULT_USERDATA_SUBTREE).join("meta-data")
    }

    /// One subtree per VM IP.
    pub fn vm_root(&self, vm_ip: &str) -> PathBuf {
        self.html_root().join(vm_ip)
    }

    pub fn vm_meta_dir(&self, vm_ip: &str) -> PathBuf {
        self.vm_root(vm_ip).join("meta-data")
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.html_root()).await?;
        Ok(())
    }
}

/// Write `content` only if it differs from what is on disk; returns whether a
/// write happened. The restart/refresh decisions key off this.
pub async fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::write(path, content).await?;
    Ok(true)
}
