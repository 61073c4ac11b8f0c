use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{AgentError, Result};

/// Named in-process locks serializing the agent's subsystems.
///
/// `dnsmasq` covers config files, numeric-id reads and refresh counters for
/// the whole DHCP subsystem (the allocation table is shared state, so this is
/// deliberately not per-namespace). The prepare locks keep DHCP and userdata
/// namespace wiring mutually exclusive within themselves without
/// cross-contention between the two.
#[derive(Debug, Default)]
pub struct AgentLocks {
    pub dnsmasq: Mutex<()>,
    pub dhcp_prepare: Mutex<()>,
    pub userdata_prepare: Mutex<()>,
}

/// Host-wide exclusive lock shared with every other rule-table editor on the
/// host (iptables' own `--wait` uses the same file).
#[derive(Debug, Clone)]
pub struct XtablesLock {
    path: PathBuf,
}

/// Held for the duration of a rule-table edit; the OS releases the flock when
/// the guard drops.
pub struct XtablesGuard {
    _lock: Flock<File>,
}

impl XtablesLock {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Block until the host-wide lock is ours. Blocking flock runs on the
    /// blocking pool so the runtime keeps serving other namespaces.
    pub async fn lock(&self) -> Result<XtablesGuard> {
        let path = self.path.clone();
        let lock = tokio::task::spawn_blocking(move || {
            let file = File::options()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| std::io::Error::from(errno))
        })
        .await
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))??;
        trace!(path = %self.path.display(), "acquired xtables lock");
        Ok(XtablesGuard { _lock: lock })
    }
}
