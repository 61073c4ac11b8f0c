//! Per-tenant network-service reconciliation: namespace-scoped dnsmasq and
//! lighttpd instances, wired and isolated from declared bindings.

pub mod addr;
pub mod agent;
pub mod command;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod host;
pub mod isolation;
pub mod locks;
pub mod names;
pub mod paths;
pub mod state;
pub mod supervisor;
pub mod userdata;
pub mod wiring;

pub use agent::{NetworkAgent, reply};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use host::{HostNetwork, ShellHost};
