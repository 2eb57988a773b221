use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use cumulus_agent::{AgentCommand, AgentDispatcher, AttachIsoPayload};
use cumulus_common::{Error, Result, Template, Vm};

use crate::catalog::Catalog;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Performs the hypervisor-level ISO attach/detach. The orchestrator owns
/// the VM record update; this collaborator only talks to the VM's host.
#[async_trait]
pub trait VmManager: Send + Sync {
    async fn attach_iso_to_vm(&self, vm: &Vm, iso: &Template, attach: bool) -> Result<bool>;
}

pub struct AgentVmManager {
    catalog: Catalog,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl AgentVmManager {
    pub fn new(catalog: Catalog, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            catalog,
            dispatcher,
        }
    }
}

#[async_trait]
impl VmManager for AgentVmManager {
    async fn attach_iso_to_vm(&self, vm: &Vm, iso: &Template, attach: bool) -> Result<bool> {
        let Some(host_id) = &vm.host_id else {
            // Stopped VM with no placement: nothing to tell a hypervisor,
            // the record update alone takes effect at next start.
            debug!(vm_id = %vm.vm_id, "VM has no host, applying ISO change to record only");
            return Ok(true);
        };

        let host = self.catalog.get_host(host_id).await?.ok_or_else(|| {
            Error::ConfigurationInconsistency(format!("VM {} references unknown host {host_id}", vm.vm_id))
        })?;

        let iso_source_url = self
            .catalog
            .ready_host_assoc_in_zone(&iso.template_id, &vm.zone_id, None)
            .await?
            .map(|(assoc, sec_host)| {
                format!(
                    "{}/{}",
                    sec_host.storage_url.unwrap_or_default().trim_end_matches('/'),
                    assoc.install_path.unwrap_or_default()
                )
            });

        let payload = AttachIsoPayload {
            vm_name: vm.name.clone(),
            iso_unique_name: iso.unique_name.clone(),
            iso_source_url,
        };
        let command = if attach {
            AgentCommand::AttachIso(payload)
        } else {
            AgentCommand::DetachIso(payload)
        };

        let answer = self.dispatcher.dispatch(&host, command, ATTACH_TIMEOUT).await;
        Ok(answer.result)
    }
}
