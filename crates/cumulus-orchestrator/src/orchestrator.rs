use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cumulus_agent::{
    AgentCommand, AgentDispatcher, DestroyPoolCopyPayload, DownloadToPoolPayload,
};
use cumulus_common::{
    Account, AccountTier, DownloadState, Error, HostAssociation, PoolAssociation, Presence,
    Result, Template, TemplateKind, UsageEvent, UsageEventKind, Vm, SYSTEM_ACCOUNT_ID,
};

use crate::adapter::{AdapterRegistry, TemplateRegistration};
use crate::catalog::Catalog;
use crate::extract::{validate_push_url, ExtractMode, Resolver};
use crate::lock_table::LockTable;
use crate::monitor::{DownloadMonitor, UploadMonitor};
use crate::permission::{AccountService, ResourceKind};
use crate::util::now_ms;
use crate::vm_manager::VmManager;

/// Ceiling for waiting on another in-flight download of the same association.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1200);

/// Image transfer into a pool is slow; match the agent-side ceiling.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

const DESTROY_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Display text marking the XenServer paravirtualization driver ISO, which
/// only a Xen-family hypervisor can mount.
const XEN_PV_DRIVER_ISO: &str = "xen-pv-drv-iso";

/// The template/ISO lifecycle core.
///
/// Composes the catalog, lock table, agent dispatcher, adapter registry,
/// transfer monitors, and permission validation into the lifecycle
/// operations. Collaborators are constructor-injected; the orchestrator
/// performs no ambient lookups.
pub struct TemplateOrchestrator {
    catalog: Catalog,
    dispatcher: Arc<dyn AgentDispatcher>,
    locks: LockTable,
    adapters: AdapterRegistry,
    accounts: Arc<dyn AccountService>,
    download_monitor: Arc<dyn DownloadMonitor>,
    upload_monitor: Arc<dyn UploadMonitor>,
    vm_manager: Arc<dyn VmManager>,
    resolver: Arc<dyn Resolver>,
}

impl TemplateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Catalog,
        dispatcher: Arc<dyn AgentDispatcher>,
        adapters: AdapterRegistry,
        accounts: Arc<dyn AccountService>,
        download_monitor: Arc<dyn DownloadMonitor>,
        upload_monitor: Arc<dyn UploadMonitor>,
        vm_manager: Arc<dyn VmManager>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            catalog,
            dispatcher,
            locks: LockTable::new(),
            adapters,
            accounts,
            download_monitor,
            upload_monitor,
            vm_manager,
            resolver,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn require_template(&self, template_id: &str, desc: &str) -> Result<Template> {
        self.catalog
            .get_template(template_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unable to find {desc} {template_id}")))
    }

    /// Ownership/visibility validation shared by attach, detach, and copy.
    ///
    /// Normal-tier callers must own the VM, and must own the template unless
    /// it is public (PERHOST templates bypass the visibility check). Admin
    /// tiers go through the delegated access check instead.
    async fn validate_caller(
        &self,
        caller: &Account,
        vm: Option<&Vm>,
        template: Option<&Template>,
        context: &str,
    ) -> Result<()> {
        if !caller.is_admin() {
            if let Some(vm) = vm {
                if vm.account_id != caller.account_id {
                    return Err(Error::PermissionDenied(format!(
                        "{context}: permission denied"
                    )));
                }
            }
            if let Some(template) = template {
                let bypasses = template.is_public || template.kind == TemplateKind::PerHost;
                if !bypasses && template.account_id != caller.account_id {
                    return Err(Error::PermissionDenied(format!(
                        "{context}: permission denied"
                    )));
                }
            }
            return Ok(());
        }

        if let Some(vm) = vm {
            let owner = self.owner_account(&vm.account_id).await?;
            self.accounts.check_access(caller, &owner).await?;
        }
        if let Some(template) = template {
            if !template.is_public {
                let owner = self.owner_account(&template.account_id).await?;
                self.accounts.check_access(caller, &owner).await?;
            }
        }
        Ok(())
    }

    async fn owner_account(&self, account_id: &str) -> Result<Account> {
        self.catalog
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unknown account {account_id}")))
    }

    // ── Registration ─────────────────────────────────────────────────

    pub async fn register_template(&self, req: TemplateRegistration) -> Result<Template> {
        let adapter = self.adapters.get(req.hypervisor)?;
        let profile = adapter.prepare(req).await?;
        adapter.create(profile).await
    }

    pub async fn register_iso(&self, req: TemplateRegistration) -> Result<Template> {
        let adapter = self.adapters.get(cumulus_common::HypervisorKind::None)?;
        if !req.format.is_iso() {
            return Err(Error::InvalidInput(
                "ISO registration requires the iso format".into(),
            ));
        }
        let profile = adapter.prepare(req).await?;
        adapter.create(profile).await
    }

    // ── Prepare-for-use (pool download) ──────────────────────────────

    /// Ensure `template_id` is present and DOWNLOADED in `pool_id`,
    /// downloading it from secondary storage if necessary.
    ///
    /// Returns `Ok(None)` when no secondary-storage source exists or every
    /// pool host failed the transfer: "not ready", the caller may retry.
    pub async fn prepare_template_in_pool(
        &self,
        template_id: &str,
        pool_id: &str,
    ) -> Result<Option<PoolAssociation>> {
        let template = self.require_template(template_id, "template").await?;
        let pool = self
            .catalog
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unable to find pool {pool_id}")))?;

        // Fast path: the prepare request itself proves the cached copy is
        // wanted, so the GC mark clears whether or not we return early.
        let mut existing = self.catalog.pool_assoc(pool_id, template_id).await?;
        if let Some(assoc) = existing.as_mut() {
            assoc.marked_for_gc = false;
            assoc.updated_at_ms = now_ms();
            self.catalog.save_pool_assoc(assoc).await?;
            if assoc.state == DownloadState::Downloaded {
                debug!(template_id, pool_id, "template already downloaded to pool");
                return Ok(Some(assoc.clone()));
            }
        }

        let Some((src_assoc, src_host)) = self
            .catalog
            .ready_host_assoc_in_zone(template_id, &pool.zone_id, pool.pod_id.as_deref())
            .await?
        else {
            debug!(
                template_id,
                zone_id = %pool.zone_id,
                "no secondary storage host holds a complete copy"
            );
            return Ok(None);
        };

        let secondary_url = src_host.storage_url.clone().ok_or_else(|| {
            Error::ConfigurationInconsistency(format!(
                "secondary storage host {} has no storage URL",
                src_host.host_id
            ))
        })?;

        let assoc = match existing {
            Some(assoc) => assoc,
            None => {
                debug!(template_id, pool_id, "creating pool association");
                let fresh = PoolAssociation::new(pool_id, template_id, now_ms());
                if self.catalog.try_create_pool_assoc(&fresh).await? {
                    fresh
                } else {
                    // Another caller created it between our lookup and now.
                    debug!(template_id, pool_id, "lost association create race, re-fetching");
                    self.catalog.pool_assoc(pool_id, template_id).await?.ok_or_else(|| {
                        Error::Store(anyhow::anyhow!(
                            "pool association for template {template_id} in pool {pool_id} vanished after create race"
                        ))
                    })?
                }
            }
        };

        // Serializes concurrent downloads of the same association. The lock
        // guard releases on every exit path below.
        let _guard = self.locks.acquire(&assoc.assoc_id, LOCK_TIMEOUT).await?;

        let mut assoc = self
            .catalog
            .pool_assoc(pool_id, template_id)
            .await?
            .ok_or_else(|| {
                Error::Store(anyhow::anyhow!(
                    "pool association for template {template_id} vanished while locked"
                ))
            })?;
        if assoc.state == DownloadState::Downloaded {
            // Another holder finished while we waited.
            return Ok(Some(assoc));
        }

        let source_url = format!(
            "{}/{}",
            secondary_url.trim_end_matches('/'),
            src_assoc.install_path.as_deref().unwrap_or_default()
        );

        for attachment in self.catalog.pool_hosts(pool_id).await? {
            let Some(host) = self.catalog.get_host(&attachment.host_id).await? else {
                warn!(host_id = %attachment.host_id, "pool references unknown host, skipping");
                continue;
            };

            debug!(template_id, host_id = %host.host_id, "downloading template via host");
            let command = AgentCommand::DownloadToPool(DownloadToPoolPayload {
                template_unique_name: template.unique_name.clone(),
                source_url: source_url.clone(),
                format: template.format,
                account_id: template.account_id.clone(),
                pool_id: pool_id.to_string(),
                secondary_storage_url: secondary_url.clone(),
                primary_storage_url: pool.storage_url(),
                local_path: attachment.local_path.clone(),
            });

            let answer = self.dispatcher.dispatch(&host, command, DOWNLOAD_TIMEOUT).await;
            if answer.result && answer.install_path.is_some() {
                assoc.state = DownloadState::Downloaded;
                assoc.percent = 100;
                assoc.local_download_path = answer.install_path.clone();
                assoc.install_path = answer.install_path;
                assoc.size_bytes = answer.size_bytes;
                assoc.updated_at_ms = now_ms();
                self.catalog.save_pool_assoc(&assoc).await?;
                info!(template_id, pool_id, host_id = %host.host_id, "template downloaded to pool");
                return Ok(Some(assoc));
            }
            debug!(
                template_id,
                host_id = %host.host_id,
                details = answer.details.as_deref().unwrap_or("no answer"),
                "pool download failed on host"
            );
        }

        // Every host failed or none are attached; the association keeps its
        // prior state so a later call can retry.
        debug!(template_id, pool_id, "template could not be downloaded to pool");
        Ok(None)
    }

    /// Administrative recovery for stuck DOWNLOADING associations. Uses the
    /// same lock key as the prepare path so it cannot race an in-flight
    /// download.
    pub async fn reset_download_state(&self, pool_id: &str, template_id: &str) -> Result<bool> {
        let Some(assoc) = self.catalog.pool_assoc(pool_id, template_id).await? else {
            warn!(template_id, pool_id, "no pool association to reset");
            return Ok(false);
        };

        let _guard = match self.locks.acquire(&assoc.assoc_id, LOCK_TIMEOUT).await {
            Ok(guard) => guard,
            Err(Error::LockTimeout { key }) => {
                warn!(template_id, pool_id, key = %key, "reset failed to acquire association lock");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut assoc = match self.catalog.pool_assoc(pool_id, template_id).await? {
            Some(assoc) => assoc,
            None => return Ok(false),
        };
        assoc.state = DownloadState::NotDownloaded;
        assoc.percent = 0;
        assoc.updated_at_ms = now_ms();
        self.catalog.save_pool_assoc(&assoc).await?;
        Ok(true)
    }

    // ── Cross-zone copy ──────────────────────────────────────────────

    /// Make a template available in the destination zone's secondary
    /// storage. Returns the template on success, `None` when every
    /// destination host failed (retryable).
    pub async fn copy_template(
        &self,
        caller: &Account,
        template_id: &str,
        src_zone_id: &str,
        dst_zone_id: &str,
    ) -> Result<Option<Template>> {
        if src_zone_id == dst_zone_id {
            return Err(Error::InvalidInput(
                "source and destination zones must differ".into(),
            ));
        }
        if self.catalog.get_zone(src_zone_id).await?.is_none() {
            return Err(Error::InvalidInput(format!("unknown source zone {src_zone_id}")));
        }
        if self.catalog.get_zone(dst_zone_id).await?.is_none() {
            return Err(Error::InvalidInput(format!(
                "unknown destination zone {dst_zone_id}"
            )));
        }

        let template = self.require_template(template_id, "template").await?;
        if template.is_removed() {
            return Err(Error::InvalidInput(format!(
                "template {template_id} is removed"
            )));
        }

        // Already present in the destination: nothing to do.
        if self
            .catalog
            .ready_host_assoc_in_zone(template_id, dst_zone_id, None)
            .await?
            .is_some()
        {
            debug!(template_id, dst_zone_id, "template already in destination zone");
            return Ok(Some(template));
        }

        let Some((src_assoc, src_host)) = self
            .catalog
            .ready_host_assoc_in_zone(template_id, src_zone_id, None)
            .await?
        else {
            return Err(Error::InvalidInput(format!(
                "template {template_id} is not available in zone {src_zone_id}"
            )));
        };

        self.validate_caller(caller, None, Some(&template), "unable to copy template")
            .await?;

        if self
            .copy(&template, &src_assoc, &src_host, dst_zone_id)
            .await?
        {
            Ok(Some(template))
        } else {
            warn!(template_id, dst_zone_id, "copy failed on every destination host");
            Ok(None)
        }
    }

    async fn copy(
        &self,
        template: &Template,
        src_assoc: &HostAssociation,
        src_host: &cumulus_common::Host,
        dst_zone_id: &str,
    ) -> Result<bool> {
        let dst_hosts = self.catalog.secondary_hosts_in_zone(dst_zone_id).await?;
        if dst_hosts.is_empty() {
            return Err(Error::ConfigurationInconsistency(format!(
                "destination zone {dst_zone_id} has no secondary storage hosts"
            )));
        }

        let owner_id = &template.account_id;
        if self
            .accounts
            .resource_limit_exceeded(owner_id, ResourceKind::Template)
            .await?
        {
            return Err(Error::ResourceLimitExceeded {
                account_id: owner_id.clone(),
                resource: ResourceKind::Template.to_string(),
            });
        }

        let event_kind = if template.format.is_iso() {
            UsageEventKind::IsoCopy
        } else {
            UsageEventKind::TemplateCopy
        };

        for dst_host in &dst_hosts {
            // Short check-and-update critical section, separate from the
            // long copy dispatch below.
            if let Some(existing) = self
                .catalog
                .host_assoc(&dst_host.host_id, &template.template_id)
                .await?
            {
                let _row = self.locks.acquire(&existing.assoc_id, LOCK_TIMEOUT).await?;
                let Some(mut assoc) = self
                    .catalog
                    .host_assoc(&dst_host.host_id, &template.template_id)
                    .await?
                else {
                    continue;
                };

                match (assoc.state, assoc.presence) {
                    (DownloadState::Downloaded, Presence::Active) => {
                        return Ok(true);
                    }
                    (DownloadState::Downloaded, Presence::SoftDeleted) => {
                        assoc.presence = Presence::Active;
                        assoc.updated_at_ms = now_ms();
                        self.catalog.save_host_assoc(&assoc).await?;
                        info!(
                            template_id = %template.template_id,
                            host_id = %dst_host.host_id,
                            "revived soft-deleted copy in destination zone"
                        );
                        return Ok(true);
                    }
                    (DownloadState::DownloadError, Presence::SoftDeleted) => {
                        assoc.presence = Presence::Active;
                        assoc.state = DownloadState::NotDownloaded;
                        assoc.percent = 0;
                        assoc.copy_requested = true;
                        assoc.error = None;
                        assoc.job_id = None;
                        assoc.updated_at_ms = now_ms();
                        self.catalog.save_host_assoc(&assoc).await?;
                    }
                    _ => {}
                }
            }

            if self
                .download_monitor
                .copy_template(template, src_assoc, src_host, dst_host)
                .await?
            {
                self.catalog
                    .add_template_to_zone(&template.template_id, dst_zone_id)
                    .await?;

                if template.account_id != SYSTEM_ACCOUNT_ID {
                    let event = UsageEvent::new(
                        event_kind,
                        &template.account_id,
                        dst_zone_id,
                        &template.template_id,
                        src_assoc.size_bytes,
                        now_ms(),
                    );
                    self.catalog.record_usage_event(&event).await?;
                }
                // First success wins; remaining hosts are not attempted.
                return Ok(true);
            }
        }

        Ok(false)
    }

    // ── Eviction ─────────────────────────────────────────────────────

    /// Remove a template's cached copy from one pool. A pool with no
    /// attached hosts is a no-op: there is nothing to contact, and the
    /// association stays.
    pub async fn evict_from_pool(&self, pool_id: &str, template_id: &str) -> Result<()> {
        let Some(assoc) = self.catalog.pool_assoc(pool_id, template_id).await? else {
            debug!(template_id, pool_id, "nothing cached in pool, nothing to evict");
            return Ok(());
        };
        let pool = self
            .catalog
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unable to find pool {pool_id}")))?;

        let attachments = self.catalog.pool_hosts(pool_id).await?;
        let Some(first) = attachments.first() else {
            return Ok(());
        };
        // Any attached host can issue the destroy.
        let host = self
            .catalog
            .get_host(&first.host_id)
            .await?
            .ok_or_else(|| {
                Error::ConfigurationInconsistency(format!(
                    "pool {pool_id} references unknown host {}",
                    first.host_id
                ))
            })?;

        debug!(template_id, pool_id, host_id = %host.host_id, "evicting template from pool");
        let command = AgentCommand::DestroyPoolCopy(DestroyPoolCopyPayload {
            pool_id: pool_id.to_string(),
            primary_storage_url: pool.storage_url(),
            assoc_id: assoc.assoc_id.clone(),
            install_path: assoc.install_path.clone(),
        });

        let answer = self.dispatcher.dispatch(&host, command, DESTROY_TIMEOUT).await;
        if answer.result {
            if self.catalog.remove_pool_assoc(pool_id, template_id).await? {
                info!(template_id, pool_id, "template evicted from pool");
            }
        } else {
            warn!(
                template_id,
                pool_id,
                details = answer.details.as_deref().unwrap_or("no answer"),
                "destroy command failed, keeping association"
            );
        }
        Ok(())
    }

    /// Pool associations eligible for eviction: downloaded, not SYSTEM, not
    /// ISO, and not backing any live volume in the pool.
    pub async fn unused_templates_in_pool(&self, pool_id: &str) -> Result<Vec<PoolAssociation>> {
        let mut unused = Vec::new();
        for assoc in self.catalog.pool_assocs(pool_id).await? {
            let Some(template) = self.catalog.get_template(&assoc.template_id).await? else {
                continue;
            };
            if template.kind == TemplateKind::System {
                continue;
            }
            if assoc.state != DownloadState::Downloaded {
                continue;
            }
            if template.format.is_iso() {
                continue;
            }
            if self
                .catalog
                .any_volume_using_template_in_pool(&assoc.template_id, pool_id)
                .await?
            {
                continue;
            }
            unused.push(assoc);
        }
        Ok(unused)
    }

    // ── Extraction ───────────────────────────────────────────────────

    pub async fn extract_template(
        &self,
        caller: &Account,
        template_id: &str,
        zone_id: &str,
        url: Option<&str>,
        mode: &str,
    ) -> Result<Option<String>> {
        self.extract(caller, template_id, zone_id, url, mode, false)
            .await
    }

    pub async fn extract_iso(
        &self,
        caller: &Account,
        template_id: &str,
        zone_id: &str,
        url: Option<&str>,
        mode: &str,
    ) -> Result<Option<String>> {
        self.extract(caller, template_id, zone_id, url, mode, true)
            .await
    }

    async fn extract(
        &self,
        caller: &Account,
        template_id: &str,
        zone_id: &str,
        url: Option<&str>,
        mode: &str,
        iso: bool,
    ) -> Result<Option<String>> {
        let desc = if iso { "ISO" } else { "template" };
        let template = self.require_template(template_id, desc).await?;
        if template.is_removed() {
            return Err(Error::InvalidInput(format!("{desc} {template_id} is removed")));
        }
        if template.kind == TemplateKind::System {
            return Err(Error::InvalidInput(format!(
                "{desc} {} is a default system template and cannot be extracted",
                template.display_text
            )));
        }
        if template.kind == TemplateKind::PerHost {
            return Err(Error::InvalidInput(format!(
                "{desc} {} lives on compute hosts and cannot be extracted",
                template.display_text
            )));
        }
        if iso != template.format.is_iso() {
            return Err(Error::InvalidInput(format!(
                "unsupported format, could not extract the {desc}"
            )));
        }
        if self.catalog.get_zone(zone_id).await?.is_none() {
            return Err(Error::InvalidInput(format!("unknown zone {zone_id}")));
        }

        // Full admins always may; everyone else needs an extractable
        // template they own, or a public extractable one.
        if caller.tier != AccountTier::Admin {
            let own = template.account_id == caller.account_id && template.extractable;
            let public = template.account_id != caller.account_id
                && template.is_public
                && template.extractable;
            if !own && !public {
                return Err(Error::PermissionDenied(format!(
                    "unable to extract {desc} {template_id}"
                )));
            }
        }

        let secondary = self.catalog.host_assoc_in_zone(template_id, zone_id).await?;
        if let Some((assoc, _)) = &secondary {
            if assoc.state != DownloadState::Downloaded {
                return Err(Error::InvalidInput(format!(
                    "the {desc} has not been downloaded to secondary storage yet"
                )));
            }
        }

        match ExtractMode::parse(mode)? {
            ExtractMode::FtpUpload => {
                let url = url.ok_or_else(|| {
                    Error::InvalidInput("an upload URL is required for ftp_upload".into())
                })?;
                validate_push_url(url, self.resolver.as_ref()).await?;

                if self
                    .upload_monitor
                    .is_upload_in_progress(template_id, iso)
                    .await
                {
                    return Err(Error::InvalidInput(format!(
                        "an upload of {} is already in progress",
                        template.display_text
                    )));
                }

                let (assoc, host) = secondary.ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{desc} {template_id} is not available on secondary storage"
                    ))
                })?;
                let job_id = self
                    .upload_monitor
                    .extract_to_url(&template, url, &host, &assoc)
                    .await?;
                Ok(Some(job_id))
            }
            ExtractMode::HttpDownload => {
                let src = secondary.as_ref().map(|(a, h)| (h, a));
                self.upload_monitor.create_download_url(&template, src).await
            }
        }
    }

    // ── Attach / detach ISO ──────────────────────────────────────────

    pub async fn attach_iso(&self, caller: &Account, vm_id: &str, iso_id: &str) -> Result<bool> {
        let vm = self
            .catalog
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unable to find VM {vm_id}")))?;
        let iso = self.require_template(iso_id, "ISO").await?;
        if !iso.format.is_iso() {
            return Err(Error::InvalidInput(format!("{iso_id} is not an ISO")));
        }

        if !vm.state.allows_iso_change() {
            return Err(Error::InvalidState(format!(
                "VM {vm_id} is {:?}, must be Running or Stopped",
                vm.state
            )));
        }

        self.validate_caller(caller, Some(&vm), Some(&iso), "unable to attach ISO")
            .await?;

        if iso.display_text == XEN_PV_DRIVER_ISO && !vm.hypervisor.is_xen_family() {
            return Err(Error::IncompatibleHypervisor(format!(
                "cannot attach XenServer PV drivers to a {:?} VM",
                vm.hypervisor
            )));
        }

        self.apply_iso_change(vm, &iso, true).await
    }

    pub async fn detach_iso(&self, caller: &Account, vm_id: &str) -> Result<bool> {
        let vm = self
            .catalog
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unable to find VM {vm_id}")))?;
        let iso_id = vm.iso_id.clone().ok_or_else(|| {
            Error::InvalidInput(format!("VM {vm_id} has no ISO attached to it"))
        })?;

        if !vm.state.allows_iso_change() {
            return Err(Error::InvalidState(format!(
                "VM {vm_id} is {:?}, must be Running or Stopped",
                vm.state
            )));
        }

        self.validate_caller(caller, Some(&vm), None, "unable to detach ISO")
            .await?;

        let iso = self.require_template(&iso_id, "ISO").await?;
        self.apply_iso_change(vm, &iso, false).await
    }

    async fn apply_iso_change(&self, mut vm: Vm, iso: &Template, attach: bool) -> Result<bool> {
        let ok = self.vm_manager.attach_iso_to_vm(&vm, iso, attach).await?;
        if attach {
            if ok {
                vm.iso_id = Some(iso.template_id.clone());
                self.catalog.put_vm(&vm).await?;
            }
        } else {
            // Detach clears the reference even when the hypervisor call
            // reports failure; the media is gone either way.
            vm.iso_id = None;
            self.catalog.put_vm(&vm).await?;
        }
        Ok(ok)
    }

    // ── Deletion ─────────────────────────────────────────────────────

    pub async fn delete_template(
        &self,
        caller: &Account,
        template_id: &str,
        zone_id: Option<&str>,
    ) -> Result<bool> {
        let template = self.require_template(template_id, "template").await?;
        if template.format.is_iso() {
            return Err(Error::InvalidInput(
                "please specify a valid template (got an ISO)".into(),
            ));
        }
        self.delete(caller, template, zone_id).await
    }

    pub async fn delete_iso(
        &self,
        caller: &Account,
        template_id: &str,
        zone_id: Option<&str>,
    ) -> Result<bool> {
        let template = self.require_template(template_id, "ISO").await?;
        if !template.format.is_iso() {
            return Err(Error::InvalidInput(
                "please specify a valid ISO (got a disk template)".into(),
            ));
        }
        if let Some(zone_id) = zone_id {
            if self
                .catalog
                .secondary_hosts_in_zone(zone_id)
                .await?
                .is_empty()
            {
                return Err(Error::InvalidInput(format!(
                    "zone {zone_id} has no secondary storage host"
                )));
            }
        }
        self.delete(caller, template, zone_id).await
    }

    async fn delete(
        &self,
        caller: &Account,
        template: Template,
        zone_id: Option<&str>,
    ) -> Result<bool> {
        if template.is_removed() {
            return Err(Error::InvalidInput(format!(
                "template {} is already removed",
                template.template_id
            )));
        }

        match caller.tier {
            AccountTier::Normal => {
                if caller.account_id != template.account_id {
                    return Err(Error::PermissionDenied(format!(
                        "account {} may not delete template {}",
                        caller.account_id, template.template_id
                    )));
                }
            }
            AccountTier::DomainAdmin => {
                let owner = self.owner_account(&template.account_id).await?;
                self.accounts.check_access(caller, &owner).await?;
            }
            _ => {}
        }

        let adapter = self.adapters.get(template.hypervisor)?;
        let profile = adapter
            .prepare_delete(template, zone_id.map(str::to_string))
            .await?;
        adapter.delete(profile).await
    }
}

/// Shared test fixtures: a mock dispatcher, a canned topology, and a fully
/// wired orchestrator over the in-memory store.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use cumulus_agent::AgentAnswer;
    use cumulus_common::{
        Host, HostKind, HypervisorKind, ImageFormat, PoolHost, StoragePool, VmState, Zone,
    };
    use cumulus_meta::MemoryMetaStore;

    use crate::adapter::StockTemplateAdapter;
    use crate::monitor::{AgentDownloadMonitor, AgentUploadMonitor};
    use crate::permission::StaticAccountService;
    use crate::vm_manager::AgentVmManager;

    pub(crate) struct MockDispatcher {
        sent: StdMutex<Vec<(String, &'static str)>>,
        failing: StdMutex<HashSet<&'static str>>,
        delay: Option<Duration>,
    }

    impl MockDispatcher {
        pub(crate) fn ok() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                failing: StdMutex::new(HashSet::new()),
                delay: None,
            }
        }

        pub(crate) fn failing(kinds: &[&'static str]) -> Self {
            let d = Self::ok();
            d.failing.lock().unwrap().extend(kinds);
            d
        }

        pub(crate) fn slow(delay: Duration) -> Self {
            let mut d = Self::ok();
            d.delay = Some(delay);
            d
        }

        pub(crate) fn count(&self, kind: &str) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, k)| *k == kind)
                .count()
        }

        pub(crate) fn last_host(&self, kind: &str) -> Option<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(_, k)| *k == kind)
                .map(|(h, _)| h.clone())
        }
    }

    #[async_trait]
    impl AgentDispatcher for MockDispatcher {
        async fn dispatch(
            &self,
            host: &Host,
            command: AgentCommand,
            _timeout: Duration,
        ) -> AgentAnswer {
            let kind = command.kind_name();
            self.sent
                .lock()
                .unwrap()
                .push((host.host_id.clone(), kind));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(kind) {
                return AgentAnswer::failure("injected failure");
            }
            AgentAnswer {
                result: true,
                details: None,
                install_path: Some("template/img".to_string()),
                size_bytes: Some(1 << 30),
            }
        }
    }

    pub(crate) struct TestResolver;

    #[async_trait]
    impl Resolver for TestResolver {
        async fn resolve(&self, host: &str) -> Option<IpAddr> {
            (host == "storage.example.org").then(|| IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
        }
    }

    pub(crate) struct World {
        pub(crate) orch: TemplateOrchestrator,
        pub(crate) dispatcher: Arc<MockDispatcher>,
        pub(crate) accounts: Arc<StaticAccountService>,
        pub(crate) catalog: Catalog,
    }

    pub(crate) fn account(id: &str, tier: AccountTier) -> Account {
        Account {
            account_id: id.to_string(),
            name: id.to_string(),
            tier,
        }
    }

    pub(crate) fn secondary(id: &str, zone: &str) -> Host {
        Host {
            host_id: id.to_string(),
            zone_id: zone.to_string(),
            pod_id: None,
            name: id.to_string(),
            address: format!("{id}.example:9090"),
            kind: HostKind::SecondaryStorage,
            storage_url: Some(format!("nfs://{id}/export")),
        }
    }

    pub(crate) async fn world_with(dispatcher: MockDispatcher) -> World {
        let dispatcher = Arc::new(dispatcher);
        let catalog = Catalog::new(Arc::new(MemoryMetaStore::new()));

        for zone in ["z1", "z2"] {
            catalog
                .put_zone(&Zone {
                    zone_id: zone.to_string(),
                    name: zone.to_string(),
                })
                .await
                .unwrap();
        }
        catalog.put_host(&secondary("sec1", "z1")).await.unwrap();
        catalog.put_host(&secondary("sec2", "z2")).await.unwrap();
        catalog
            .put_host(&Host {
                host_id: "node1".to_string(),
                zone_id: "z1".to_string(),
                pod_id: None,
                name: "node1".to_string(),
                address: "node1.example:9090".to_string(),
                kind: HostKind::Compute,
                storage_url: None,
            })
            .await
            .unwrap();
        catalog
            .put_pool(&StoragePool {
                pool_id: "p1".to_string(),
                zone_id: "z1".to_string(),
                pod_id: None,
                name: "p1".to_string(),
                address: "filer1".to_string(),
                path: "/export/p1".to_string(),
            })
            .await
            .unwrap();
        catalog
            .put_pool_host(&PoolHost {
                pool_id: "p1".to_string(),
                host_id: "node1".to_string(),
                local_path: "/mnt/p1".to_string(),
            })
            .await
            .unwrap();

        for (id, tier) in [
            ("admin", AccountTier::Admin),
            ("alice", AccountTier::Normal),
            ("bob", AccountTier::Normal),
            (SYSTEM_ACCOUNT_ID, AccountTier::Normal),
        ] {
            catalog.put_account(&account(id, tier)).await.unwrap();
        }

        let accounts = Arc::new(StaticAccountService::new(None));
        let download_monitor = Arc::new(AgentDownloadMonitor::new(
            catalog.clone(),
            dispatcher.clone(),
        ));
        let upload_monitor = Arc::new(AgentUploadMonitor::new(
            catalog.clone(),
            dispatcher.clone(),
        ));
        let adapter = Arc::new(StockTemplateAdapter::new(
            catalog.clone(),
            accounts.clone(),
            download_monitor.clone(),
        ));
        let adapters = AdapterRegistry::new()
            .register(HypervisorKind::Kvm, adapter.clone())
            .register(HypervisorKind::None, adapter);
        let vm_manager = Arc::new(AgentVmManager::new(catalog.clone(), dispatcher.clone()));

        let orch = TemplateOrchestrator::new(
            catalog.clone(),
            dispatcher.clone(),
            adapters,
            accounts.clone(),
            download_monitor,
            upload_monitor,
            vm_manager,
            Arc::new(TestResolver),
        );

        World {
            orch,
            dispatcher,
            accounts,
            catalog,
        }
    }

    pub(crate) async fn world() -> World {
        world_with(MockDispatcher::ok()).await
    }

    pub(crate) fn template(id: &str, owner: &str) -> Template {
        Template {
            template_id: id.to_string(),
            unique_name: format!("{id}-uniq"),
            display_text: id.to_string(),
            format: ImageFormat::Qcow2,
            kind: TemplateKind::User,
            hypervisor: HypervisorKind::Kvm,
            is_public: false,
            featured: false,
            extractable: false,
            requires_hvm: true,
            bits: 64,
            account_id: owner.to_string(),
            source_url: Some("http://images.example.org/disk.qcow2".to_string()),
            checksum: None,
            guest_os_id: "ubuntu".to_string(),
            bootable: true,
            created_at_ms: 1,
            removed_at_ms: None,
        }
    }

    pub(crate) fn iso(id: &str, owner: &str) -> Template {
        let mut t = template(id, owner);
        t.format = ImageFormat::Iso;
        t.hypervisor = HypervisorKind::None;
        t
    }

    pub(crate) fn vm(id: &str, owner: &str, state: VmState, host: Option<&str>) -> Vm {
        Vm {
            vm_id: id.to_string(),
            name: id.to_string(),
            account_id: owner.to_string(),
            zone_id: "z1".to_string(),
            host_id: host.map(str::to_string),
            hypervisor: HypervisorKind::Kvm,
            state,
            template_id: None,
            iso_id: None,
        }
    }

    /// Downloaded, live copy of `template_id` on secondary host `host_id`.
    pub(crate) async fn seed_ready(w: &World, template_id: &str, host_id: &str) {
        let mut assoc = HostAssociation::new(host_id, template_id, 1);
        assoc.state = DownloadState::Downloaded;
        assoc.percent = 100;
        assoc.install_path = Some(format!("template/{template_id}"));
        assoc.size_bytes = Some(5 << 20);
        w.catalog.save_host_assoc(&assoc).await.unwrap();
    }

    pub(crate) fn registration(name: &str, owner: &str) -> TemplateRegistration {
        TemplateRegistration {
            name: name.to_string(),
            display_text: name.to_string(),
            format: ImageFormat::Qcow2,
            kind: TemplateKind::User,
            hypervisor: HypervisorKind::Kvm,
            zone_id: "z1".to_string(),
            origin_url: "http://images.example.org/disk.qcow2".to_string(),
            is_public: false,
            featured: false,
            extractable: false,
            requires_hvm: true,
            bits: 64,
            checksum: None,
            guest_os_id: "ubuntu".to_string(),
            bootable: true,
            account_id: owner.to_string(),
        }
    }

    /// World with template `t1` owned by alice, fully staged on `sec1`.
    pub(crate) async fn ready_world() -> World {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        w
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    use cumulus_common::{StoragePool, VmState, Volume, Zone};

    // ── Prepare ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn prepare_downloads_into_pool() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let assoc = w
            .orch
            .prepare_template_in_pool("t1", "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assoc.state, DownloadState::Downloaded);
        assert_eq!(assoc.percent, 100);
        assert!(assoc.install_path.is_some());
        assert!(assoc.size_bytes.is_some());
        assert_eq!(w.dispatcher.count("download_to_pool"), 1);
        assert_eq!(
            w.dispatcher.last_host("download_to_pool").as_deref(),
            Some("node1")
        );
    }

    #[tokio::test]
    async fn prepare_without_secondary_source_is_not_ready() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();

        let out = w.orch.prepare_template_in_pool("t1", "p1").await.unwrap();
        assert!(out.is_none());
        assert_eq!(w.dispatcher.count("download_to_pool"), 0);
    }

    #[tokio::test]
    async fn prepare_clears_gc_mark_without_redownloading() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        let mut assoc = PoolAssociation::new("p1", "t1", 1);
        assoc.state = DownloadState::Downloaded;
        assoc.install_path = Some("template/t1".to_string());
        assoc.marked_for_gc = true;
        w.catalog.save_pool_assoc(&assoc).await.unwrap();

        let out = w
            .orch
            .prepare_template_in_pool("t1", "p1")
            .await
            .unwrap()
            .unwrap();
        assert!(!out.marked_for_gc);
        assert_eq!(out.state, DownloadState::Downloaded);
        assert_eq!(w.dispatcher.count("download_to_pool"), 0);
    }

    #[tokio::test]
    async fn prepare_failure_leaves_association_retryable() {
        let w = world_with(MockDispatcher::failing(&["download_to_pool"])).await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let out = w.orch.prepare_template_in_pool("t1", "p1").await.unwrap();
        assert!(out.is_none());

        let assoc = w.catalog.pool_assoc("p1", "t1").await.unwrap().unwrap();
        assert_eq!(assoc.state, DownloadState::NotDownloaded);
    }

    #[tokio::test]
    async fn concurrent_prepares_download_once() {
        let w = world_with(MockDispatcher::slow(Duration::from_millis(50))).await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let (a, b) = tokio::join!(
            w.orch.prepare_template_in_pool("t1", "p1"),
            w.orch.prepare_template_in_pool("t1", "p1"),
        );
        assert_eq!(a.unwrap().unwrap().state, DownloadState::Downloaded);
        assert_eq!(b.unwrap().unwrap().state, DownloadState::Downloaded);
        assert_eq!(w.dispatcher.count("download_to_pool"), 1);
    }

    #[tokio::test]
    async fn prepare_rejects_secondary_host_without_storage_url() {
        let w = world().await;
        let mut host = secondary("sec1", "z1");
        host.storage_url = None;
        w.catalog.put_host(&host).await.unwrap();
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let err = w.orch.prepare_template_in_pool("t1", "p1").await.unwrap_err();
        assert!(matches!(err, Error::ConfigurationInconsistency(_)));
    }

    #[tokio::test]
    async fn reset_clears_stuck_download() {
        let w = world().await;
        let mut assoc = PoolAssociation::new("p1", "t1", 1);
        assoc.state = DownloadState::Downloading;
        assoc.percent = 42;
        w.catalog.save_pool_assoc(&assoc).await.unwrap();

        assert!(w.orch.reset_download_state("p1", "t1").await.unwrap());
        let assoc = w.catalog.pool_assoc("p1", "t1").await.unwrap().unwrap();
        assert_eq!(assoc.state, DownloadState::NotDownloaded);
        assert_eq!(assoc.percent, 0);

        assert!(!w.orch.reset_download_state("p1", "missing").await.unwrap());
    }

    // ── Copy ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn copy_transfers_and_emits_one_usage_event() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let alice = account("alice", AccountTier::Normal);

        let out = w
            .orch
            .copy_template(&alice, "t1", "z1", "z2")
            .await
            .unwrap();
        assert!(out.is_some());

        let assoc = w.catalog.host_assoc("sec2", "t1").await.unwrap().unwrap();
        assert!(assoc.is_ready());
        assert!(assoc.copy_requested);

        let events = w.catalog.list_usage_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UsageEventKind::TemplateCopy);
        // Sized from the source copy, not the transfer answer.
        assert_eq!(events[0].size_bytes, Some(5 << 20));

        // Idempotent: the second copy is satisfied by the existing copy.
        let again = w
            .orch
            .copy_template(&alice, "t1", "z1", "z2")
            .await
            .unwrap();
        assert!(again.is_some());
        assert_eq!(w.dispatcher.count("copy_to_secondary"), 1);
        assert_eq!(w.catalog.list_usage_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn copy_rejects_bad_zones_and_missing_source() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        let alice = account("alice", AccountTier::Normal);

        let err = w
            .orch
            .copy_template(&alice, "t1", "z1", "z1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // No complete copy in the source zone.
        let err = w
            .orch
            .copy_template(&alice, "t1", "z1", "z2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn copy_enforces_visibility_for_normal_accounts() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let bob = account("bob", AccountTier::Normal);

        let err = w
            .orch
            .copy_template(&bob, "t1", "z1", "z2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let mut public = template("t2", "alice");
        public.is_public = true;
        w.catalog.put_template(&public).await.unwrap();
        seed_ready(&w, "t2", "sec1").await;
        assert!(w
            .orch
            .copy_template(&bob, "t2", "z1", "z2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn copy_checks_owner_quota() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        w.accounts.set_limit("alice", 0);

        let err = w
            .orch
            .copy_template(&account("alice", AccountTier::Normal), "t1", "z1", "z2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn copy_revives_soft_deleted_destination_copy() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let mut gone = HostAssociation::new("sec2", "t1", 1);
        gone.state = DownloadState::Downloaded;
        gone.install_path = Some("template/t1".to_string());
        gone.presence = Presence::SoftDeleted;
        w.catalog.save_host_assoc(&gone).await.unwrap();

        let out = w
            .orch
            .copy_template(&account("alice", AccountTier::Normal), "t1", "z1", "z2")
            .await
            .unwrap();
        assert!(out.is_some());

        let assoc = w.catalog.host_assoc("sec2", "t1").await.unwrap().unwrap();
        assert_eq!(assoc.presence, Presence::Active);
        // Revival moves no bytes.
        assert_eq!(w.dispatcher.count("copy_to_secondary"), 0);
    }

    #[tokio::test]
    async fn copy_of_system_owned_template_emits_no_event() {
        let w = world().await;
        w.catalog
            .put_template(&template("t1", SYSTEM_ACCOUNT_ID))
            .await
            .unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let out = w
            .orch
            .copy_template(&account("admin", AccountTier::Admin), "t1", "z1", "z2")
            .await
            .unwrap();
        assert!(out.is_some());
        assert!(w.catalog.list_usage_events().await.unwrap().is_empty());
    }

    // ── Eviction ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn evict_destroys_pool_copy() {
        let w = world().await;
        let mut assoc = PoolAssociation::new("p1", "t1", 1);
        assoc.state = DownloadState::Downloaded;
        assoc.install_path = Some("template/t1".to_string());
        w.catalog.save_pool_assoc(&assoc).await.unwrap();

        w.orch.evict_from_pool("p1", "t1").await.unwrap();
        assert!(w.catalog.pool_assoc("p1", "t1").await.unwrap().is_none());
        assert_eq!(w.dispatcher.count("destroy_pool_copy"), 1);

        // Nothing cached: nothing dispatched.
        w.orch.evict_from_pool("p1", "t2").await.unwrap();
        assert_eq!(w.dispatcher.count("destroy_pool_copy"), 1);
    }

    #[tokio::test]
    async fn evict_then_prepare_redownloads_from_scratch() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let first = w
            .orch
            .prepare_template_in_pool("t1", "p1")
            .await
            .unwrap()
            .unwrap();
        w.orch.evict_from_pool("p1", "t1").await.unwrap();
        assert!(w.catalog.pool_assoc("p1", "t1").await.unwrap().is_none());

        let second = w
            .orch
            .prepare_template_in_pool("t1", "p1")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.assoc_id, second.assoc_id);
        assert_eq!(second.state, DownloadState::Downloaded);
        assert_eq!(w.dispatcher.count("download_to_pool"), 2);
    }

    #[tokio::test]
    async fn evict_keeps_association_when_destroy_fails() {
        let w = world_with(MockDispatcher::failing(&["destroy_pool_copy"])).await;
        let assoc = PoolAssociation::new("p1", "t1", 1);
        w.catalog.save_pool_assoc(&assoc).await.unwrap();

        w.orch.evict_from_pool("p1", "t1").await.unwrap();
        assert!(w.catalog.pool_assoc("p1", "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evict_is_noop_for_pool_with_no_hosts() {
        let w = world().await;
        w.catalog
            .put_pool(&StoragePool {
                pool_id: "p2".to_string(),
                zone_id: "z1".to_string(),
                pod_id: None,
                name: "p2".to_string(),
                address: "filer2".to_string(),
                path: "/export/p2".to_string(),
            })
            .await
            .unwrap();
        let assoc = PoolAssociation::new("p2", "t1", 1);
        w.catalog.save_pool_assoc(&assoc).await.unwrap();

        w.orch.evict_from_pool("p2", "t1").await.unwrap();
        assert!(w.catalog.pool_assoc("p2", "t1").await.unwrap().is_some());
        assert_eq!(w.dispatcher.count("destroy_pool_copy"), 0);
    }

    #[tokio::test]
    async fn unused_skips_system_iso_incomplete_and_in_use() {
        let w = world().await;
        let mut sys = template("tsys", SYSTEM_ACCOUNT_ID);
        sys.kind = TemplateKind::System;
        w.catalog.put_template(&sys).await.unwrap();
        w.catalog.put_template(&iso("tiso", "alice")).await.unwrap();
        w.catalog.put_template(&template("tuse", "alice")).await.unwrap();
        w.catalog.put_template(&template("tpart", "alice")).await.unwrap();
        w.catalog.put_template(&template("tfree", "alice")).await.unwrap();

        for id in ["tsys", "tiso", "tuse", "tfree"] {
            let mut a = PoolAssociation::new("p1", id, 1);
            a.state = DownloadState::Downloaded;
            w.catalog.save_pool_assoc(&a).await.unwrap();
        }
        let mut partial = PoolAssociation::new("p1", "tpart", 1);
        partial.state = DownloadState::Downloading;
        w.catalog.save_pool_assoc(&partial).await.unwrap();

        w.catalog
            .put_volume(&Volume {
                volume_id: "v1".to_string(),
                pool_id: "p1".to_string(),
                template_id: Some("tuse".to_string()),
                vm_id: None,
                removed: false,
            })
            .await
            .unwrap();
        // A removed volume no longer pins its template.
        w.catalog
            .put_volume(&Volume {
                volume_id: "v2".to_string(),
                pool_id: "p1".to_string(),
                template_id: Some("tfree".to_string()),
                vm_id: None,
                removed: true,
            })
            .await
            .unwrap();

        let unused = w.orch.unused_templates_in_pool("p1").await.unwrap();
        let ids: Vec<_> = unused.iter().map(|a| a.template_id.as_str()).collect();
        assert_eq!(ids, vec!["tfree"]);
    }

    // ── Extraction ───────────────────────────────────────────────────

    #[tokio::test]
    async fn extract_push_returns_job_id() {
        let w = world().await;
        let mut t = template("t1", "alice");
        t.extractable = true;
        w.catalog.put_template(&t).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let job = w
            .orch
            .extract_template(
                &account("alice", AccountTier::Normal),
                "t1",
                "z1",
                Some("ftp://storage.example.org/dump"),
                "ftp_upload",
            )
            .await
            .unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn extract_rejects_protected_kinds_and_formats() {
        let w = world().await;
        let admin = account("admin", AccountTier::Admin);

        let mut sys = template("tsys", SYSTEM_ACCOUNT_ID);
        sys.kind = TemplateKind::System;
        w.catalog.put_template(&sys).await.unwrap();
        let mut per_host = template("tph", SYSTEM_ACCOUNT_ID);
        per_host.kind = TemplateKind::PerHost;
        w.catalog.put_template(&per_host).await.unwrap();
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();

        for id in ["tsys", "tph"] {
            let err = w
                .orch
                .extract_template(&admin, id, "z1", None, "http_download")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{id}");
        }

        // A disk template is not an ISO.
        let err = w
            .orch
            .extract_iso(&admin, "t1", "z1", None, "http_download")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = w
            .orch
            .extract_template(&admin, "t1", "z1", None, "carrier_pigeon")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
    }

    #[tokio::test]
    async fn extract_requires_extractable_for_non_admins() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;

        let err = w
            .orch
            .extract_template(
                &account("alice", AccountTier::Normal),
                "t1",
                "z1",
                None,
                "http_download",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // Full admins bypass the extractable flag.
        let out = w
            .orch
            .extract_template(
                &account("admin", AccountTier::Admin),
                "t1",
                "z1",
                None,
                "http_download",
            )
            .await
            .unwrap();
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn extract_of_foreign_template_needs_public_and_extractable() {
        let w = world().await;
        let mut t = template("t1", "alice");
        t.extractable = true;
        w.catalog.put_template(&t).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let bob = account("bob", AccountTier::Normal);

        let err = w
            .orch
            .extract_template(&bob, "t1", "z1", None, "http_download")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        t.is_public = true;
        w.catalog.put_template(&t).await.unwrap();
        let out = w
            .orch
            .extract_template(&bob, "t1", "z1", None, "http_download")
            .await
            .unwrap();
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn extract_waits_for_complete_secondary_copy() {
        let w = world().await;
        let mut t = template("t1", "alice");
        t.extractable = true;
        w.catalog.put_template(&t).await.unwrap();

        let mut assoc = HostAssociation::new("sec1", "t1", 1);
        assoc.state = DownloadState::Downloading;
        w.catalog.save_host_assoc(&assoc).await.unwrap();

        let err = w
            .orch
            .extract_template(
                &account("alice", AccountTier::Normal),
                "t1",
                "z1",
                Some("ftp://storage.example.org/dump"),
                "ftp_upload",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn extract_pull_without_secondary_copy_is_not_ready() {
        let w = world().await;
        let mut t = template("t1", "alice");
        t.extractable = true;
        w.catalog.put_template(&t).await.unwrap();

        let out = w
            .orch
            .extract_template(
                &account("alice", AccountTier::Normal),
                "t1",
                "z1",
                None,
                "http_download",
            )
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn extract_rejects_bad_push_targets() {
        let w = world().await;
        let mut t = template("t1", "alice");
        t.extractable = true;
        w.catalog.put_template(&t).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let alice = account("alice", AccountTier::Normal);

        let err = w
            .orch
            .extract_template(&alice, "t1", "z1", Some("ftp://127.0.0.1/x"), "ftp_upload")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));

        let err = w
            .orch
            .extract_template(
                &alice,
                "t1",
                "z1",
                Some("ftp://unknown.invalid/x"),
                "ftp_upload",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedHost(_)));
    }

    // ── Attach / detach ──────────────────────────────────────────────

    #[tokio::test]
    async fn attach_and_detach_update_vm_record() {
        let w = world().await;
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();
        seed_ready(&w, "i1", "sec1").await;
        w.catalog
            .put_vm(&vm("vm1", "alice", VmState::Running, Some("node1")))
            .await
            .unwrap();
        let alice = account("alice", AccountTier::Normal);

        assert!(w.orch.attach_iso(&alice, "vm1", "i1").await.unwrap());
        let got = w.catalog.get_vm("vm1").await.unwrap().unwrap();
        assert_eq!(got.iso_id.as_deref(), Some("i1"));
        assert_eq!(w.dispatcher.last_host("attach_iso").as_deref(), Some("node1"));

        assert!(w.orch.detach_iso(&alice, "vm1").await.unwrap());
        let got = w.catalog.get_vm("vm1").await.unwrap().unwrap();
        assert!(got.iso_id.is_none());
        assert_eq!(w.dispatcher.count("detach_iso"), 1);
    }

    #[tokio::test]
    async fn attach_to_unplaced_vm_updates_record_only() {
        let w = world().await;
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();
        w.catalog
            .put_vm(&vm("vm1", "alice", VmState::Stopped, None))
            .await
            .unwrap();

        assert!(w
            .orch
            .attach_iso(&account("alice", AccountTier::Normal), "vm1", "i1")
            .await
            .unwrap());
        let got = w.catalog.get_vm("vm1").await.unwrap().unwrap();
        assert_eq!(got.iso_id.as_deref(), Some("i1"));
        assert_eq!(w.dispatcher.count("attach_iso"), 0);
    }

    #[tokio::test]
    async fn attach_rejects_bad_state_owner_and_hypervisor() {
        let w = world().await;
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();
        let mut pv = iso("ipv", "alice");
        pv.display_text = XEN_PV_DRIVER_ISO.to_string();
        pv.is_public = true;
        w.catalog.put_template(&pv).await.unwrap();
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        let alice = account("alice", AccountTier::Normal);

        for (id, state) in [("vm1", VmState::Starting), ("vmd", VmState::Destroyed)] {
            w.catalog
                .put_vm(&vm(id, "alice", state, Some("node1")))
                .await
                .unwrap();
            let err = w.orch.attach_iso(&alice, id, "i1").await.unwrap_err();
            assert!(matches!(err, Error::InvalidState(_)), "{id}");
        }

        w.catalog
            .put_vm(&vm("vm2", "bob", VmState::Running, Some("node1")))
            .await
            .unwrap();
        let err = w.orch.attach_iso(&alice, "vm2", "i1").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // PV driver ISO on a KVM guest.
        w.catalog
            .put_vm(&vm("vm3", "alice", VmState::Running, Some("node1")))
            .await
            .unwrap();
        let err = w.orch.attach_iso(&alice, "vm3", "ipv").await.unwrap_err();
        assert!(matches!(err, Error::IncompatibleHypervisor(_)));

        let err = w.orch.attach_iso(&alice, "vm3", "t1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn detach_clears_record_even_when_agent_fails() {
        let w = world_with(MockDispatcher::failing(&["detach_iso"])).await;
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();
        let mut machine = vm("vm1", "alice", VmState::Running, Some("node1"));
        machine.iso_id = Some("i1".to_string());
        w.catalog.put_vm(&machine).await.unwrap();

        let ok = w
            .orch
            .detach_iso(&account("alice", AccountTier::Normal), "vm1")
            .await
            .unwrap();
        assert!(!ok);
        let got = w.catalog.get_vm("vm1").await.unwrap().unwrap();
        assert!(got.iso_id.is_none());
    }

    #[tokio::test]
    async fn detach_without_attached_iso_is_rejected() {
        let w = world().await;
        w.catalog
            .put_vm(&vm("vm1", "alice", VmState::Running, Some("node1")))
            .await
            .unwrap();

        let err = w
            .orch
            .detach_iso(&account("alice", AccountTier::Normal), "vm1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    // ── Registration / deletion ──────────────────────────────────────

    #[tokio::test]
    async fn register_persists_and_starts_secondary_fetch() {
        let w = world().await;

        let t = w
            .orch
            .register_template(registration("web", "alice"))
            .await
            .unwrap();
        assert!(t.unique_name.starts_with("web-"));
        assert!(w
            .catalog
            .get_template(&t.template_id)
            .await
            .unwrap()
            .is_some());
        // The fetch association is created before the transfer runs.
        assert!(w
            .catalog
            .host_assoc("sec1", &t.template_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn register_enforces_quota_and_iso_format() {
        let w = world().await;
        w.accounts.set_limit("alice", 1);

        w.orch
            .register_template(registration("one", "alice"))
            .await
            .unwrap();
        let err = w
            .orch
            .register_template(registration("two", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceLimitExceeded { .. }));

        let err = w
            .orch
            .register_iso(registration("not-an-iso", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_refuses_while_vms_remain_then_soft_deletes() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let alice = account("alice", AccountTier::Normal);

        let mut machine = vm("vm1", "alice", VmState::Running, Some("node1"));
        machine.template_id = Some("t1".to_string());
        w.catalog.put_vm(&machine).await.unwrap();

        assert!(!w.orch.delete_template(&alice, "t1", None).await.unwrap());

        machine.state = VmState::Destroyed;
        w.catalog.put_vm(&machine).await.unwrap();
        assert!(w.orch.delete_template(&alice, "t1", None).await.unwrap());

        let t = w.catalog.get_template("t1").await.unwrap().unwrap();
        assert!(t.is_removed());
        let assoc = w.catalog.host_assoc("sec1", "t1").await.unwrap().unwrap();
        assert_eq!(assoc.presence, Presence::SoftDeleted);
    }

    #[tokio::test]
    async fn delete_checks_ownership_and_artifact_kind() {
        let w = world().await;
        w.catalog.put_template(&template("t1", "alice")).await.unwrap();
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();

        let err = w
            .orch
            .delete_template(&account("bob", AccountTier::Normal), "t1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err = w
            .orch
            .delete_template(&account("alice", AccountTier::Normal), "i1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = w
            .orch
            .delete_iso(&account("alice", AccountTier::Normal), "t1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn domain_admin_deletes_own_template() {
        let w = world().await;
        w.catalog
            .put_account(&account("carol", AccountTier::DomainAdmin))
            .await
            .unwrap();
        w.catalog.put_template(&template("t1", "carol")).await.unwrap();
        seed_ready(&w, "t1", "sec1").await;
        let carol = account("carol", AccountTier::DomainAdmin);

        assert!(w.orch.delete_template(&carol, "t1", None).await.unwrap());
        let t = w.catalog.get_template("t1").await.unwrap().unwrap();
        assert!(t.is_removed());
    }

    #[tokio::test]
    async fn delete_iso_in_zone_requires_secondary_host() {
        let w = world().await;
        w.catalog
            .put_zone(&Zone {
                zone_id: "z3".to_string(),
                name: "z3".to_string(),
            })
            .await
            .unwrap();
        w.catalog.put_template(&iso("i1", "alice")).await.unwrap();

        let err = w
            .orch
            .delete_iso(&account("alice", AccountTier::Normal), "i1", Some("z3"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
