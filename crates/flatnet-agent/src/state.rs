use std::collections::HashMap;

/// Process-wide reconciler state, rebuilt empty at agent start and guarded by
/// the named locks in [`crate::locks::AgentLocks`]. Nothing here is
/// persisted; anything durable is re-derived from live kernel or filesystem
/// state.
#[derive(Debug, Default)]
pub struct ReconcilerState {
    /// l3-network uuid → member VM IPs, insertion-ordered, unique. Drives
    /// the per-VM rewrite rules in the shared metadata vhost.
    userdata_vms: HashMap<String, Vec<String>>,
    /// Consecutive SIGHUP reloads sent per namespace since the last restart.
    refresh_counts: HashMap<String, u32>,
}

impl ReconcilerState {
    /// Record a VM IP as a member of an l3 network. Re-adding an existing
    /// member is a no-op so repeated applies stay idempotent.
    pub fn record_vm_ip(&mut self, l3_uuid: &str, vm_ip: &str) {
        let ips = self.userdata_vms.entry(l3_uuid.to_string()).or_default();
        if !ips.iter().any(|ip| ip == vm_ip) {
            ips.push(vm_ip.to_string());
        }
    }

    pub fn remove_vm_ip(&mut self, l3_uuid: &str, vm_ip: &str) {
        if let Some(ips) = self.userdata_vms.get_mut(l3_uuid) {
            ips.retain(|ip| ip != vm_ip);
        }
    }

    /// Forget every member of an l3 network (namespace cleanup).
    pub fn clear_l3(&mut self, l3_uuid: &str) {
        self.userdata_vms.remove(l3_uuid);
    }

    pub fn vm_ips(&self, l3_uuid: &str) -> &[String] {
        self.userdata_vms.get(l3_uuid).map_or(&[], Vec::as_slice)
    }

    /// Bump a namespace's refresh counter; returns the new count.
    pub fn count_refresh(&mut self, namespace: &str) -> u32 {
        let count = self.refresh_counts.entry(namespace.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_refresh(&mut self, namespace: &str) {
        self.refresh_counts.remove(namespace);
    }

    pub fn refresh_count(&self, namespace: &str) -> u32 {
        self.refresh_counts.get(namespace).copied().unwrap_or(0)
    }
}
