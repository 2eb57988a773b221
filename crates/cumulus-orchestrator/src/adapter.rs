use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use cumulus_common::{
    Error, HypervisorKind, ImageFormat, Presence, Result, Template, TemplateKind,
    SYSTEM_ACCOUNT_ID,
};

use crate::catalog::Catalog;
use crate::monitor::DownloadMonitor;
use crate::permission::{AccountService, ResourceKind};
use crate::util::now_ms;

/// Validated registration request, as handed over by the command layer.
#[derive(Debug, Clone)]
pub struct TemplateRegistration {
    pub name: String,
    pub display_text: String,
    pub format: ImageFormat,
    pub kind: TemplateKind,
    pub hypervisor: HypervisorKind,
    pub zone_id: String,
    pub origin_url: String,
    pub is_public: bool,
    pub featured: bool,
    pub extractable: bool,
    pub requires_hvm: bool,
    pub bits: u32,
    pub checksum: Option<String>,
    pub guest_os_id: String,
    pub bootable: bool,
    pub account_id: String,
}

/// Intermediate result of an adapter's prepare step, consumed by the
/// matching create/delete step.
#[derive(Debug, Clone)]
pub struct TemplateProfile {
    pub template: Template,
    pub zone_id: Option<String>,
}

/// Hypervisor-specific template registration semantics.
///
/// Registration and deletion are two-step: `prepare` validates and builds a
/// profile without touching shared state, then `create`/`delete` commits.
#[async_trait]
pub trait TemplateAdapter: Send + Sync {
    async fn prepare(&self, req: TemplateRegistration) -> Result<TemplateProfile>;
    async fn create(&self, profile: TemplateProfile) -> Result<Template>;
    async fn prepare_delete(
        &self,
        template: Template,
        zone_id: Option<String>,
    ) -> Result<TemplateProfile>;
    async fn delete(&self, profile: TemplateProfile) -> Result<bool>;
}

/// Explicit hypervisor-kind → adapter map, assembled once at process start.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<HypervisorKind, Arc<dyn TemplateAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: HypervisorKind, adapter: Arc<dyn TemplateAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn get(&self, kind: HypervisorKind) -> Result<Arc<dyn TemplateAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            Error::ConfigurationInconsistency(format!(
                "no template adapter registered for hypervisor {kind:?}"
            ))
        })
    }
}

/// Stock adapter: persists the template record, registers it in its zone,
/// and kicks the secondary-storage fetch. Suits every hypervisor family
/// whose registration has no extra side effects.
pub struct StockTemplateAdapter {
    catalog: Catalog,
    accounts: Arc<dyn AccountService>,
    download_monitor: Arc<dyn DownloadMonitor>,
}

impl StockTemplateAdapter {
    pub fn new(
        catalog: Catalog,
        accounts: Arc<dyn AccountService>,
        download_monitor: Arc<dyn DownloadMonitor>,
    ) -> Self {
        Self {
            catalog,
            accounts,
            download_monitor,
        }
    }
}

#[async_trait]
impl TemplateAdapter for StockTemplateAdapter {
    async fn prepare(&self, req: TemplateRegistration) -> Result<TemplateProfile> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("template name must not be empty".into()));
        }

        // ISO registrations carry no hypervisor requirement; disk templates
        // must name one.
        if req.format.is_iso() && req.hypervisor != HypervisorKind::None {
            return Err(Error::InvalidInput(
                "an ISO cannot require a specific hypervisor".into(),
            ));
        }
        if !req.format.is_iso() && req.hypervisor == HypervisorKind::None {
            return Err(Error::InvalidInput(
                "a disk template must name its hypervisor".into(),
            ));
        }

        if matches!(req.kind, TemplateKind::System | TemplateKind::PerHost) && req.extractable {
            return Err(Error::InvalidInput(format!(
                "{:?} templates are never extractable",
                req.kind
            )));
        }

        if self.catalog.get_zone(&req.zone_id).await?.is_none() {
            return Err(Error::InvalidInput(format!("unknown zone {}", req.zone_id)));
        }
        if self.catalog.get_account(&req.account_id).await?.is_none() {
            return Err(Error::InvalidInput(format!(
                "unknown account {}",
                req.account_id
            )));
        }

        if self
            .accounts
            .resource_limit_exceeded(&req.account_id, ResourceKind::Template)
            .await?
        {
            return Err(Error::ResourceLimitExceeded {
                account_id: req.account_id.clone(),
                resource: ResourceKind::Template.to_string(),
            });
        }

        let template_id = uuid::Uuid::new_v4().to_string();
        let template = Template {
            unique_name: format!("{}-{}", req.name, &template_id[..8]),
            template_id,
            display_text: req.display_text,
            format: req.format,
            kind: req.kind,
            hypervisor: req.hypervisor,
            is_public: req.is_public,
            featured: req.featured,
            extractable: req.extractable,
            requires_hvm: req.requires_hvm,
            bits: req.bits,
            account_id: req.account_id,
            source_url: Some(req.origin_url),
            checksum: req.checksum,
            guest_os_id: req.guest_os_id,
            bootable: req.bootable,
            created_at_ms: now_ms(),
            removed_at_ms: None,
        };

        Ok(TemplateProfile {
            template,
            zone_id: Some(req.zone_id),
        })
    }

    async fn create(&self, profile: TemplateProfile) -> Result<Template> {
        let template = profile.template;
        let zone_id = profile.zone_id.ok_or_else(|| {
            Error::InvalidInput("registration profile is missing its zone".into())
        })?;

        self.catalog.put_template(&template).await?;
        self.catalog
            .add_template_to_zone(&template.template_id, &zone_id)
            .await?;

        self.download_monitor
            .download_to_secondary(&template, &zone_id)
            .await?;

        if template.account_id != SYSTEM_ACCOUNT_ID {
            self.accounts
                .increment_resource_count(&template.account_id, ResourceKind::Template)
                .await?;
        }

        info!(
            template_id = %template.template_id,
            zone_id = %zone_id,
            format = ?template.format,
            "template registered"
        );
        Ok(template)
    }

    async fn prepare_delete(
        &self,
        template: Template,
        zone_id: Option<String>,
    ) -> Result<TemplateProfile> {
        if template.is_removed() {
            return Err(Error::InvalidInput(format!(
                "template {} is already removed",
                template.template_id
            )));
        }
        Ok(TemplateProfile { template, zone_id })
    }

    async fn delete(&self, profile: TemplateProfile) -> Result<bool> {
        let mut template = profile.template;

        // Refuse while any zone still has live VMs created from it.
        for assoc in self
            .catalog
            .host_assocs_for_template(&template.template_id)
            .await?
        {
            let Some(host) = self.catalog.get_host(&assoc.host_id).await? else {
                continue;
            };
            if let Some(zone) = &profile.zone_id {
                if host.zone_id != *zone {
                    continue;
                }
            }
            let live = self
                .catalog
                .live_vms_from_template(&host.zone_id, &template.template_id)
                .await?;
            if !live.is_empty() {
                debug!(
                    template_id = %template.template_id,
                    zone_id = %host.zone_id,
                    vm_count = live.len(),
                    "template still in use, refusing delete"
                );
                return Ok(false);
            }
        }

        for mut assoc in self
            .catalog
            .host_assocs_for_template(&template.template_id)
            .await?
        {
            if let Some(zone) = &profile.zone_id {
                match self.catalog.get_host(&assoc.host_id).await? {
                    Some(host) if host.zone_id == *zone => {}
                    _ => continue,
                }
            }
            assoc.presence = Presence::SoftDeleted;
            assoc.updated_at_ms = now_ms();
            self.catalog.save_host_assoc(&assoc).await?;
        }

        // Zone-scoped deletes keep the template record; a full delete
        // soft-removes it and returns the quota slot.
        if profile.zone_id.is_none() {
            template.removed_at_ms = Some(now_ms());
            self.catalog.put_template(&template).await?;
            if template.account_id != SYSTEM_ACCOUNT_ID {
                self.accounts
                    .decrement_resource_count(&template.account_id, ResourceKind::Template)
                    .await?;
            }
        }

        info!(
            template_id = %template.template_id,
            zone_id = ?profile.zone_id,
            "template deleted"
        );
        Ok(true)
    }
}
