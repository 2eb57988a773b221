use serde::{Deserialize, Serialize};

use crate::template::HypervisorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Expunging,
}

impl VmState {
    /// Only Running and Stopped VMs accept ISO attach/detach.
    pub fn allows_iso_change(self) -> bool {
        matches!(self, VmState::Running | VmState::Stopped)
    }
}

/// A virtual machine instance. Stored under `/vms/{vm_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub vm_id: String,
    pub name: String,
    pub account_id: String,
    pub zone_id: String,

    /// Compute host the VM is placed on; absent while stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,

    pub hypervisor: HypervisorKind,
    pub state: VmState,

    /// Template the VM's root disk was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// Currently attached ISO, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_id: Option<String>,
}

impl Vm {
    pub fn is_expunged(&self) -> bool {
        matches!(self.state, VmState::Destroyed | VmState::Expunging)
    }
}

/// A disk volume carved out of a storage pool.
///
/// Stored under `/volumes/{volume_id}`. The orchestrator only reads volumes,
/// to decide whether a pool-cached template is still in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub pool_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,

    #[serde(default)]
    pub removed: bool,
}
