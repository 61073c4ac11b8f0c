//! Request/response schema for the flatnet network-service agent.
//!
//! One struct per operation, decoded from the orchestrator's camelCase JSON.
//! Validation of cross-field consistency (e.g. bindings of one namespace
//! agreeing on bridge and server IP) happens in the agent, not here.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Reply envelope
// ---------------------------------------------------------------------------

/// Success/error envelope returned by every agent operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// DHCP
// ---------------------------------------------------------------------------

/// A static host route pushed via the classless-static-route option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRoute {
    pub prefix: String,
    pub nexthop: String,
}

/// One MAC/IP binding served by a namespace's DHCP daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpBinding {
    pub mac: String,
    pub ip: String,
    /// 4 or 6.
    pub ip_version: u8,
    pub bridge_name: String,
    pub namespace_name: String,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_domain: Option<String>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    #[serde(default)]
    pub is_default_l3_network: bool,
    #[serde(default)]
    pub mtu: Option<u32>,
    /// IPv6 only: network prefix length for the range stanza.
    #[serde(default)]
    pub prefix_length: Option<u8>,
    /// IPv6 only: first address of the served range.
    #[serde(default)]
    pub first_ip: Option<String>,
    /// IPv6 only: last address of the served range.
    #[serde(default)]
    pub end_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDhcpCmd {
    pub dhcp: Vec<DhcpBinding>,
    /// Rewrite all config files from scratch and restart the daemon.
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDhcpCmd {
    pub dhcp: Vec<DhcpBinding>,
}

/// DHCPv6 address assignment mode.
pub const ADDRESS_MODE_STATEFUL: &str = "Stateful-DHCP";
pub const ADDRESS_MODE_STATELESS: &str = "Stateless-DHCP";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDhcpCmd {
    pub bridge_name: String,
    pub namespace_name: String,
    pub ip_version: u8,
    #[serde(default)]
    pub dhcp_server_ip: Option<String>,
    #[serde(default)]
    pub dhcp_netmask: Option<String>,
    #[serde(default)]
    pub prefix_len: Option<u8>,
    #[serde(default)]
    pub address_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNamespaceCmd {
    pub namespace_name: String,
}

/// Moves the default-gateway router option between MACs, either side optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetDefaultGatewayCmd {
    #[serde(default)]
    pub namespace_name_of_gateway_to_remove: Option<String>,
    #[serde(default)]
    pub mac_of_gateway_to_remove: Option<String>,
    #[serde(default)]
    pub gateway_to_remove: Option<String>,
    #[serde(default)]
    pub namespace_name_of_gateway_to_add: Option<String>,
    #[serde(default)]
    pub mac_of_gateway_to_add: Option<String>,
    #[serde(default)]
    pub gateway_to_add: Option<String>,
}

// ---------------------------------------------------------------------------
// Userdata / metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    pub vm_uuid: String,
    #[serde(default)]
    pub vm_hostname: Option<String>,
}

/// One VM's metadata/userdata declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserdataBinding {
    pub namespace_name: String,
    pub bridge_name: String,
    pub l3_network_uuid: String,
    pub vm_ip: String,
    pub netmask: String,
    /// Metadata HTTP server port inside the namespace.
    pub port: u16,
    /// Absent for metadata-only namespaces without a DHCP service.
    #[serde(default)]
    pub dhcp_server_ip: Option<String>,
    pub metadata: VmMetadata,
    /// Raw userdata payloads; more than one is combined into a single
    /// MIME-multipart document.
    #[serde(default)]
    pub userdata_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyUserdataCmd {
    pub userdata: UserdataBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchApplyUserdataCmd {
    pub userdata: Vec<UserdataBinding>,
    /// Kill all metadata servers up front and rebuild from scratch.
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseUserdataCmd {
    pub namespace_name: String,
    pub vm_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupUserdataCmd {
    pub bridge_name: String,
    pub namespace_name: String,
    pub l3_network_uuid: String,
}

// ---------------------------------------------------------------------------
// DNS forwarding override
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetForwardDnsCmd {
    pub dns: String,
    pub mac: String,
    pub bridge_name: String,
    pub name_space: String,
    /// Previously-pushed DNS servers to scrub before writing the new one.
    #[serde(default)]
    pub wrong_dns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveForwardDnsCmd {
    pub mac: String,
    pub bridge_name: String,
    pub name_space: String,
    #[serde(default)]
    pub dns: Option<String>,
}

// ---------------------------------------------------------------------------
// Host connect
// ---------------------------------------------------------------------------

/// Restore the host firewall baseline after (re)connecting the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectCmd {}
