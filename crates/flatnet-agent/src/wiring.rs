//! Namespace and veth plumbing.
//!
//! Reconciles the kernel objects a namespace needs before any daemon can be
//! started in it: the namespace itself with a stable numeric id, a veth pair
//! bridged to the tenant network, and the addresses on the inner end. Every
//! step checks live state first so a re-run converges instead of failing on
//! `File exists`.

use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::host::HostNetwork;

pub struct NamespaceWirer<'a, H: HostNetwork + ?Sized> {
    host: &'a H,
}

impl<'a, H: HostNetwork + ?Sized> NamespaceWirer<'a, H> {
    pub fn new(host: &'a H) -> Self {
        Self { host }
    }

    /// Namespace id for `name`, creating the namespace if needed. New
    /// namespaces get `highest live id + 1` (0 on a fresh host); ids of live
    /// namespaces are never reassigned, so the id is stable for the
    /// namespace's lifetime and everything derived from it (veth names,
    /// connector addresses) is too.
    pub async fn ensure_namespace(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.host.netns_id(name).await? {
            return Ok(id);
        }
        let id = match self.host.max_netns_id().await? {
            Some(max) => max + 1,
            None => 0,
        };
        info!(namespace = name, id, "creating network namespace");
        self.host.create_netns(name, id).await?;
        Ok(id)
    }

    /// Id of an already-wired namespace; operations that must not create one
    /// (userdata without a DHCP service) go through this.
    pub async fn namespace_id(&self, name: &str) -> Result<u32> {
        self.host
            .netns_id(name)
            .await?
            .ok_or_else(|| AgentError::NamespaceNotFound(name.to_string()))
    }

    /// Wire `outer`/`inner` between the host bridge and the namespace.
    ///
    /// An outer end without its inner peer in the namespace is an orphan from
    /// a half-torn-down previous life (the namespace was deleted, taking the
    /// inner end with it); it is removed before the pair is recreated.
    pub async fn ensure_veth_pair(
        &self,
        ns: &str,
        bridge: &str,
        outer: &str,
        inner: &str,
    ) -> Result<()> {
        let inner_present = self.host.ns_link_exists(ns, inner).await?;
        if !inner_present {
            if self.host.link_exists(outer).await? {
                debug!(dev = outer, "removing orphaned veth end");
                self.host.delete_link(outer).await;
            }
            self.host.create_veth(outer, inner).await?;
            self.host.move_link_to_netns(inner, ns).await?;
        }

        self.host.link_up(outer).await?;
        // lo stays down: bringing it up would auto-assign 127.0.0.1, which
        // the server-IP re-derivation in prepare would then read back.
        self.host.ns_link_up(ns, inner).await?;

        if !self.host.bridge_has_port(bridge, outer).await? {
            self.host.add_bridge_port(bridge, outer).await?;
        }
        Ok(())
    }

    /// Make `ip/prefix` the only address on the device. A stale address from
    /// an earlier configuration would shadow the new one, so the device is
    /// flushed before re-adding.
    pub async fn ensure_exclusive_addr(
        &self,
        ns: &str,
        dev: &str,
        ip: &str,
        prefix: u8,
    ) -> Result<()> {
        if self.host.ns_dev_has_addr(ns, dev, ip).await? {
            return Ok(());
        }
        debug!(namespace = ns, dev, ip, prefix, "reassigning device address");
        self.host.ns_flush_dev_addrs(ns, dev).await?;
        self.host
            .ns_add_addr(ns, dev, &format!("{ip}/{prefix}"))
            .await?;
        Ok(())
    }

    /// Add an address alongside whatever the device already carries
    /// (link-local v6, metadata IP).
    pub async fn ensure_addr(&self, ns: &str, dev: &str, ip: &str, prefix: u8) -> Result<()> {
        if self.host.ns_dev_has_addr(ns, dev, ip).await? {
            return Ok(());
        }
        self.host
            .ns_add_addr(ns, dev, &format!("{ip}/{prefix}"))
            .await?;
        Ok(())
    }
}
