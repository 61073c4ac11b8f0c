//! Daemon lifecycle around the per-namespace config files.
//!
//! A daemon is identified by the config file on its command line, never by a
//! pidfile: the config path encodes the namespace, so finding the process is
//! a `/proc` scan away and survives agent restarts. Start is asynchronous
//! (the daemons background themselves), so readiness is a bounded poll for
//! the process to appear.

use std::path::{Path, PathBuf};

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::host::HostNetwork;

/// One daemon launch: which binary, in which namespace, with which config.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub name: &'static str,
    pub program: PathBuf,
    pub namespace: String,
    pub conf: PathBuf,
    pub args: Vec<String>,
}

pub struct ProcessSupervisor<'a, H: HostNetwork + ?Sized> {
    host: &'a H,
    config: &'a AgentConfig,
}

impl<'a, H: HostNetwork + ?Sized> ProcessSupervisor<'a, H> {
    pub fn new(host: &'a H, config: &'a AgentConfig) -> Self {
        Self { host, config }
    }

    pub async fn pid(&self, conf: &Path) -> Result<Option<i32>> {
        self.host.find_process_by_config(conf).await
    }

    /// Kill any instance bound to the config and launch a fresh one, waiting
    /// until it shows up in the process table.
    pub async fn restart(&self, spec: &DaemonSpec) -> Result<()> {
        if let Some(pid) = self.pid(&spec.conf).await? {
            info!(daemon = spec.name, pid, "stopping for restart");
            self.host.kill_process(pid).await?;
        }
        self.host
            .spawn_daemon(&spec.namespace, &spec.program, &spec.args)
            .await?;
        self.wait_ready(spec).await
    }

    /// Ask a running instance to re-read its config.
    pub async fn reload(&self, name: &'static str, pid: i32) -> Result<()> {
        info!(daemon = name, pid, "signalling config reload");
        self.host.signal_reload(pid).await
    }

    /// Stop whatever instance is bound to the config; no instance is fine.
    pub async fn stop(&self, name: &'static str, conf: &Path) -> Result<()> {
        if let Some(pid) = self.pid(conf).await? {
            info!(daemon = name, pid, "stopping");
            self.host.kill_process(pid).await?;
        }
        Ok(())
    }

    async fn wait_ready(&self, spec: &DaemonSpec) -> Result<()> {
        let deadline = Instant::now() + self.config.readiness_deadline;
        loop {
            if self.pid(&spec.conf).await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(daemon = spec.name, conf = %spec.conf.display(), "daemon never appeared");
                return Err(AgentError::ReadinessTimeout {
                    daemon: spec.name,
                    conf: spec.conf.clone(),
                    secs: self.config.readiness_deadline.as_secs(),
                });
            }
            sleep(self.config.readiness_interval).await;
        }
    }
}
