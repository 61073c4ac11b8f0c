//! Metadata/userdata service reconciliation.
//!
//! Every namespace hosting VMs with userdata runs a lighttpd bound to the
//! metadata IP, serving a per-VM subtree keyed by source IP. Host-side
//! reachability comes from a second veth pair into a connector bridge shared
//! by all namespaces; each namespace gets one address out of the connector
//! /18, indexed by its namespace id.

use flatnet_api::UserdataBinding;
use tracing::{debug, info};

use crate::config::{
    AgentConfig, CONNECT_ALL_NETNS_BR_INNER_IP, CONNECT_ALL_NETNS_BR_NAME,
    CONNECT_ALL_NETNS_BR_OUTER_IP, CONNECT_ALL_NETNS_MASK_BITS, CONNECT_ALL_NETNS_MAX_INDEX,
    METADATA_IP,
};
use crate::addr::offset_v4;
use crate::error::{AgentError, Result};
use crate::host::HostNetwork;
use crate::names::{inner_dev, outer_dev, userdata_dev};
use crate::paths::{UserdataPaths, write_if_changed};
use crate::wiring::NamespaceWirer;

// ---- userdata packing ----

const MULTIPART_BOUNDARY: &str = "===============0035287898381583954==";

/// cloud-init needs the MIME type to dispatch each part to the right handler.
fn content_type_of(doc: &str) -> &'static str {
    if doc.starts_with("#!") {
        "text/x-shellscript"
    } else if doc.starts_with("#cloud-config") {
        "text/cloud-config"
    } else {
        "text/plain"
    }
}

/// Combine userdata documents into the single body lighttpd serves. One
/// document passes through verbatim; several become a MIME multipart.
pub fn pack_userdata(docs: &[String]) -> Option<String> {
    match docs {
        [] => None,
        [single] => Some(single.clone()),
        many => {
            let mut body = format!(
                "Content-Type: multipart/mixed; boundary=\"{MULTIPART_BOUNDARY}\"\nMIME-Version: 1.0\n\n"
            );
            for (i, doc) in many.iter().enumerate() {
                body.push_str(&format!(
                    "--{MULTIPART_BOUNDARY}\n\
                     Content-Type: {}; charset=\"us-ascii\"\n\
                     MIME-Version: 1.0\n\
                     Content-Transfer-Encoding: 7bit\n\
                     Content-Disposition: attachment; filename=\"part-{:03}\"\n\n",
                    content_type_of(doc),
                    i + 1
                ));
                body.push_str(doc);
                if !doc.ends_with('\n') {
                    body.push('\n');
                }
            }
            body.push_str(&format!("--{MULTIPART_BOUNDARY}--\n"));
            Some(body)
        }
    }
}

// ---- lighttpd conf rendering ----

fn rewrite_block(subtree: &str) -> String {
    format!(
        "    url.rewrite-once = (\n\
         \x20       \"^/user-data$\" => \"/{subtree}/user-data\",\n\
         \x20       \"^/user_data$\" => \"/{subtree}/user_data\",\n\
         \x20       \"^/meta-data/(.+)$\" => \"/{subtree}/meta-data/$1\",\n\
         \x20       \"^/meta-data$\" => \"/{subtree}/meta-data/index.html\",\n\
         \x20       \"^/meta_data.json$\" => \"/{subtree}/meta_data.json\",\n\
         \x20       \"^/password$\" => \"/{subtree}/password\"\n\
         \x20   )\n"
    )
}

/// Render the namespace's lighttpd config. Requests are routed to a VM's
/// subtree by source IP; anything else lands in the default subtree so
/// unknown VMs get empty answers instead of 404 storms.
pub fn render_lighttpd_conf(
    paths: &UserdataPaths,
    port: u16,
    pushgateway_port: u16,
    vm_ips: &[String],
) -> String {
    let mut conf = format!(
        "server.document-root = \"{}\"\n\
         server.port = {port}\n\
         server.bind = \"{METADATA_IP}\"\n\
         dir-listing.activate = \"enable\"\n\
         index-file.names = ( \"index.html\" )\n\
         server.modules += ( \"mod_rewrite\", \"mod_proxy\" )\n\n\
         $HTTP[\"url\"] =~ \"^/metrics/job\" {{\n\
         \x20   proxy.server = ( \"\" => ( ( \"host\" => \"{CONNECT_ALL_NETNS_BR_OUTER_IP}\", \"port\" => {pushgateway_port} ) ) )\n\
         }}\n",
        paths.html_root().display()
    );
    for ip in vm_ips {
        conf.push_str(&format!("else $HTTP[\"remote-ip\"] == \"{ip}\" {{\n"));
        conf.push_str(&rewrite_block(ip));
        conf.push_str("}\n");
    }
    conf.push_str("else $HTTP[\"remote-ip\"] != \"\" {\n");
    conf.push_str(&rewrite_block(crate::paths::DEFAULT_USERDATA_SUBTREE));
    conf.push_str("}\n\n");
    conf.push_str(
        "mimetype.assign = ( \".html\" => \"text/html\", \".json\" => \"application/json\", \"\" => \"text/plain\" )\n",
    );
    conf
}

// ---- reconciler ----

pub struct UserdataConfigReconciler<'a, H: HostNetwork + ?Sized> {
    host: &'a H,
    config: &'a AgentConfig,
}

impl<'a, H: HostNetwork + ?Sized> UserdataConfigReconciler<'a, H> {
    pub fn new(host: &'a H, config: &'a AgentConfig) -> Self {
        Self { host, config }
    }

    pub fn paths(&self, namespace: &str) -> UserdataPaths {
        UserdataPaths::new(&self.config.userdata_root, namespace)
    }

    /// Wire the namespace into the connector bridge and return the inner
    /// device name. The namespace id doubles as the address index, so ids
    /// beyond the /18's host range cannot be served.
    pub async fn prepare_connector(&self, namespace: &str, ns_id: u32) -> Result<String> {
        if ns_id > CONNECT_ALL_NETNS_MAX_INDEX {
            return Err(AgentError::CapacityExceeded {
                id: ns_id,
                limit: CONNECT_ALL_NETNS_MAX_INDEX,
            });
        }

        if !self.host.link_exists(CONNECT_ALL_NETNS_BR_NAME).await? {
            info!(bridge = CONNECT_ALL_NETNS_BR_NAME, "creating connector bridge");
            self.host.create_bridge(CONNECT_ALL_NETNS_BR_NAME).await?;
        }
        let outer_cidr =
            format!("{CONNECT_ALL_NETNS_BR_OUTER_IP}/{CONNECT_ALL_NETNS_MASK_BITS}");
        if !self
            .host
            .dev_has_addr(CONNECT_ALL_NETNS_BR_NAME, &outer_cidr)
            .await?
        {
            self.host
                .add_dev_addr(CONNECT_ALL_NETNS_BR_NAME, &outer_cidr)
                .await?;
        }
        self.host.link_up(CONNECT_ALL_NETNS_BR_NAME).await?;

        let wirer = NamespaceWirer::new(self.host);
        let ud_outer = userdata_dev(&outer_dev(ns_id));
        let ud_inner = userdata_dev(&inner_dev(ns_id));
        wirer
            .ensure_veth_pair(namespace, CONNECT_ALL_NETNS_BR_NAME, &ud_outer, &ud_inner)
            .await?;

        let inner_ip = offset_v4(CONNECT_ALL_NETNS_BR_INNER_IP, ns_id).to_string();
        wirer
            .ensure_exclusive_addr(namespace, &ud_inner, &inner_ip, CONNECT_ALL_NETNS_MASK_BITS)
            .await?;

        if self.host.ns_route_count(namespace).await? == 0 {
            self.host
                .ns_add_default_route(namespace, &ud_inner)
                .await?;
        }
        Ok(ud_inner)
    }

    /// Put the metadata IP on whichever namespace device already answers for
    /// the DHCP server IP, falling back to the connector device for
    /// namespaces without a DHCP service.
    pub async fn ensure_metadata_ip(
        &self,
        namespace: &str,
        dhcp_server_ip: Option<&str>,
        fallback_dev: &str,
    ) -> Result<()> {
        if self.host.ns_has_addr(namespace, METADATA_IP).await? {
            return Ok(());
        }
        let dev = match dhcp_server_ip {
            Some(ip) => self
                .host
                .ns_dev_with_addr(namespace, ip)
                .await?
                .ok_or_else(|| AgentError::MissingDevice {
                    namespace: namespace.to_string(),
                    dhcp_ip: ip.to_string(),
                })?,
            None => fallback_dev.to_string(),
        };
        debug!(namespace, dev, "assigning metadata IP");
        self.host
            .ns_add_addr(namespace, &dev, &format!("{METADATA_IP}/32"))
            .await?;
        Ok(())
    }

    /// Materialize one VM's subtree under the namespace's html root.
    pub async fn write_vm_tree(&self, binding: &UserdataBinding) -> Result<()> {
        let paths = self.paths(&binding.namespace_name);
        paths.ensure().await?;

        // default subtree answers VMs without an entry of their own
        let default_meta = paths.default_meta_dir();
        tokio::fs::create_dir_all(&default_meta).await?;
        let default_root = paths.vm_root(crate::paths::DEFAULT_USERDATA_SUBTREE);
        for name in ["user-data", "user_data"] {
            let p = default_root.join(name);
            if !p.exists() {
                tokio::fs::write(&p, b"").await?;
            }
        }

        let meta_dir = paths.vm_meta_dir(&binding.vm_ip);
        tokio::fs::create_dir_all(&meta_dir).await?;

        let hostname = binding
            .metadata
            .vm_hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| binding.vm_ip.replace('.', "-"));

        write_if_changed(&meta_dir.join("index.html"), "instance-id\nlocal-hostname\n").await?;
        write_if_changed(&meta_dir.join("instance-id"), &binding.metadata.vm_uuid).await?;
        write_if_changed(&meta_dir.join("local-hostname"), &hostname).await?;

        let vm_root = paths.vm_root(&binding.vm_ip);
        let meta_json = serde_json::json!({ "uuid": binding.metadata.vm_uuid }).to_string();
        write_if_changed(&vm_root.join("meta_data.json"), &meta_json).await?;
        write_if_changed(&vm_root.join("password"), "").await?;

        match pack_userdata(&binding.userdata_list) {
            Some(body) => {
                write_if_changed(&vm_root.join("user-data"), &body).await?;
                write_if_changed(&vm_root.join("user_data"), &body).await?;
            }
            None => {
                for name in ["user-data", "user_data"] {
                    let p = vm_root.join(name);
                    if p.exists() {
                        tokio::fs::remove_file(&p).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove one VM's subtree; absence is fine.
    pub async fn remove_vm_tree(&self, namespace: &str, vm_ip: &str) -> Result<()> {
        let root = self.paths(namespace).vm_root(vm_ip);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole namespace subtree (final cleanup).
    pub async fn remove_tree(&self, namespace: &str) -> Result<()> {
        let dir = self.paths(namespace).dir().to_path_buf();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the lighttpd config for the current VM membership; returns
    /// whether it changed.
    pub async fn sync_conf(
        &self,
        namespace: &str,
        port: u16,
        vm_ips: &[String],
    ) -> Result<bool> {
        let paths = self.paths(namespace);
        paths.ensure().await?;
        let conf = render_lighttpd_conf(&paths, port, self.config.pushgateway_port, vm_ips);
        write_if_changed(&paths.conf(), &conf).await
    }
}
