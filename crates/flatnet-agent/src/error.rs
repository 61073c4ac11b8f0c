use std::path::PathBuf;

use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bindings sharing a namespace declared conflicting attributes.
    #[error("inconsistent bindings for namespace {namespace}: {detail}")]
    InputInconsistency { namespace: String, detail: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{daemon}[conf-file:{conf:?}] is not running after being started for {secs} seconds")]
    ReadinessTimeout {
        daemon: &'static str,
        conf: PathBuf,
        secs: u64,
    },

    /// Expected device could not be located even after a wiring attempt.
    #[error("cannot find device for the DHCP IP {dhcp_ip} in namespace {namespace}")]
    MissingDevice { namespace: String, dhcp_ip: String },

    #[error("cannot find the ID for the namespace {0}")]
    NamespaceNotFound(String),

    /// The connector subnet ran out of host addresses.
    #[error("namespace id {id} exceeds the connector subnet host limit {limit}")]
    CapacityExceeded { id: u32, limit: u32 },

    #[error("invalid address {addr}: {detail}")]
    InvalidAddress { addr: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
