use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cumulus_agent::{
    AgentCommand, AgentDispatcher, CopyToSecondaryPayload, FetchTemplatePayload,
    UploadToUrlPayload,
};
use cumulus_common::{
    DownloadState, Error, Host, HostAssociation, Presence, Result, Template,
};

use crate::catalog::Catalog;
use crate::util::now_ms;

/// Bulk image transfers are slow; both copy and fetch get the same generous
/// ceiling as pool downloads.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// A generated pull URL for an extracted template.
///
/// Stored under `/extract_urls/{url_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractUrl {
    pub url_id: String,
    pub template_id: String,
    pub url: String,

    #[serde(default)]
    pub created_at_ms: u64,
}

/// Sub-workflow that moves template bytes *into* secondary storage: zone to
/// zone copies, and the initial fetch after registration.
#[async_trait]
pub trait DownloadMonitor: Send + Sync {
    /// Transfer a template between secondary storage hosts. Updates the
    /// destination host association; returns whether the transfer succeeded.
    async fn copy_template(
        &self,
        template: &Template,
        src_assoc: &HostAssociation,
        src: &Host,
        dst: &Host,
    ) -> Result<bool>;

    /// Start fetching a freshly registered template from its origin URL into
    /// the zone's secondary storage. Returns once the transfer is underway.
    async fn download_to_secondary(&self, template: &Template, zone_id: &str) -> Result<()>;
}

/// Sub-workflow that moves template bytes *out*: FTP pushes and generated
/// pull URLs.
#[async_trait]
pub trait UploadMonitor: Send + Sync {
    /// Another push of the same artifact is already running.
    async fn is_upload_in_progress(&self, template_id: &str, iso: bool) -> bool;

    /// Push the template to an external FTP target. Returns the upload job id.
    async fn extract_to_url(
        &self,
        template: &Template,
        target_url: &str,
        src: &Host,
        src_assoc: &HostAssociation,
    ) -> Result<String>;

    /// Produce a pull URL entity for later retrieval, or `None` when the
    /// template has no secondary-storage copy to serve from.
    async fn create_download_url(
        &self,
        template: &Template,
        src: Option<(&Host, &HostAssociation)>,
    ) -> Result<Option<String>>;
}

fn source_url(host: &Host, assoc: &HostAssociation) -> Result<String> {
    let base = host.storage_url.as_deref().ok_or_else(|| {
        Error::ConfigurationInconsistency(format!(
            "secondary storage host {} has no storage URL",
            host.host_id
        ))
    })?;
    let path = assoc.install_path.as_deref().unwrap_or_default();
    Ok(format!("{}/{}", base.trim_end_matches('/'), path))
}

/// `DownloadMonitor` backed by the agent dispatcher.
pub struct AgentDownloadMonitor {
    catalog: Catalog,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl AgentDownloadMonitor {
    pub fn new(catalog: Catalog, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            catalog,
            dispatcher,
        }
    }
}

#[async_trait]
impl DownloadMonitor for AgentDownloadMonitor {
    async fn copy_template(
        &self,
        template: &Template,
        src_assoc: &HostAssociation,
        src: &Host,
        dst: &Host,
    ) -> Result<bool> {
        let dest_storage_url = dst.storage_url.clone().ok_or_else(|| {
            Error::ConfigurationInconsistency(format!(
                "secondary storage host {} has no storage URL",
                dst.host_id
            ))
        })?;

        let mut assoc = self
            .catalog
            .host_assoc(&dst.host_id, &template.template_id)
            .await?
            .unwrap_or_else(|| HostAssociation::new(&dst.host_id, &template.template_id, now_ms()));
        assoc.state = DownloadState::Downloading;
        assoc.presence = Presence::Active;
        assoc.copy_requested = true;
        assoc.error = None;
        assoc.updated_at_ms = now_ms();
        self.catalog.save_host_assoc(&assoc).await?;

        let command = AgentCommand::CopyToSecondary(CopyToSecondaryPayload {
            template_unique_name: template.unique_name.clone(),
            source_url: source_url(src, src_assoc)?,
            format: template.format,
            dest_storage_url,
        });

        let answer = self.dispatcher.dispatch(dst, command, TRANSFER_TIMEOUT).await;
        if answer.result {
            assoc.state = DownloadState::Downloaded;
            assoc.percent = 100;
            assoc.install_path = answer.install_path;
            assoc.size_bytes = answer.size_bytes.or(src_assoc.size_bytes);
            assoc.updated_at_ms = now_ms();
            self.catalog.save_host_assoc(&assoc).await?;
            info!(
                template_id = %template.template_id,
                src_host = %src.host_id,
                dst_host = %dst.host_id,
                "template copied to secondary storage"
            );
            Ok(true)
        } else {
            assoc.state = DownloadState::DownloadError;
            assoc.error = answer.details.clone();
            assoc.updated_at_ms = now_ms();
            self.catalog.save_host_assoc(&assoc).await?;
            warn!(
                template_id = %template.template_id,
                dst_host = %dst.host_id,
                details = answer.details.as_deref().unwrap_or("no answer"),
                "template copy failed"
            );
            Ok(false)
        }
    }

    async fn download_to_secondary(&self, template: &Template, zone_id: &str) -> Result<()> {
        let origin_url = template.source_url.clone().ok_or_else(|| {
            Error::InvalidInput(format!(
                "template {} has no origin URL to fetch from",
                template.template_id
            ))
        })?;

        let host = self
            .catalog
            .secondary_hosts_in_zone(zone_id)
            .await?
            .into_iter()
            .find(|h| h.storage_url.is_some())
            .ok_or_else(|| {
                Error::ConfigurationInconsistency(format!(
                    "zone {zone_id} has no usable secondary storage host"
                ))
            })?;

        let mut assoc = HostAssociation::new(&host.host_id, &template.template_id, now_ms());
        assoc.state = DownloadState::Downloading;
        self.catalog.save_host_assoc(&assoc).await?;

        let command = AgentCommand::FetchTemplate(FetchTemplatePayload {
            template_unique_name: template.unique_name.clone(),
            origin_url,
            format: template.format,
            account_id: template.account_id.clone(),
            dest_storage_url: host.storage_url.clone().unwrap_or_default(),
            checksum: template.checksum.clone(),
        });

        // The fetch can run for hours; drive it from a background task and
        // record the outcome on the association.
        let catalog = self.catalog.clone();
        let dispatcher = self.dispatcher.clone();
        let template_id = template.template_id.clone();
        tokio::spawn(async move {
            let answer = dispatcher.dispatch(&host, command, TRANSFER_TIMEOUT).await;
            if answer.result {
                assoc.state = DownloadState::Downloaded;
                assoc.percent = 100;
                assoc.install_path = answer.install_path;
                assoc.size_bytes = answer.size_bytes;
            } else {
                assoc.state = DownloadState::DownloadError;
                assoc.error = answer.details;
                warn!(
                    template_id = %template_id,
                    host_id = %host.host_id,
                    details = assoc.error.as_deref().unwrap_or("no answer"),
                    "template fetch failed"
                );
            }
            assoc.updated_at_ms = now_ms();
            if let Err(e) = catalog.save_host_assoc(&assoc).await {
                warn!(template_id = %template_id, error = %e, "failed to record fetch outcome");
            }
        });

        Ok(())
    }
}

/// `UploadMonitor` backed by the agent dispatcher, with an in-process
/// in-progress set serializing pushes of the same artifact.
pub struct AgentUploadMonitor {
    catalog: Catalog,
    dispatcher: Arc<dyn AgentDispatcher>,
    in_progress: Arc<DashMap<(String, bool), ()>>,
}

impl AgentUploadMonitor {
    pub fn new(catalog: Catalog, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            catalog,
            dispatcher,
            in_progress: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl UploadMonitor for AgentUploadMonitor {
    async fn is_upload_in_progress(&self, template_id: &str, iso: bool) -> bool {
        self.in_progress
            .contains_key(&(template_id.to_string(), iso))
    }

    async fn extract_to_url(
        &self,
        template: &Template,
        target_url: &str,
        src: &Host,
        src_assoc: &HostAssociation,
    ) -> Result<String> {
        let command = AgentCommand::UploadToUrl(UploadToUrlPayload {
            template_unique_name: template.unique_name.clone(),
            source_url: source_url(src, src_assoc)?,
            target_url: target_url.to_string(),
        });

        let job_id = uuid::Uuid::new_v4().to_string();
        let key = (
            template.template_id.clone(),
            template.format.is_iso(),
        );
        self.in_progress.insert(key.clone(), ());

        let dispatcher = self.dispatcher.clone();
        let in_progress = self.in_progress.clone();
        let host = src.clone();
        let template_id = template.template_id.clone();
        let job = job_id.clone();
        tokio::spawn(async move {
            let answer = dispatcher.dispatch(&host, command, TRANSFER_TIMEOUT).await;
            if answer.result {
                info!(template_id = %template_id, job_id = %job, "upload finished");
            } else {
                warn!(
                    template_id = %template_id,
                    job_id = %job,
                    details = answer.details.as_deref().unwrap_or("no answer"),
                    "upload failed"
                );
            }
            in_progress.remove(&key);
        });

        Ok(job_id)
    }

    async fn create_download_url(
        &self,
        template: &Template,
        src: Option<(&Host, &HostAssociation)>,
    ) -> Result<Option<String>> {
        let Some((host, assoc)) = src else {
            return Ok(None);
        };

        let entry = ExtractUrl {
            url_id: uuid::Uuid::new_v4().to_string(),
            template_id: template.template_id.clone(),
            url: source_url(host, assoc)?,
            created_at_ms: now_ms(),
        };
        self.catalog.save_extract_url(&entry).await?;
        Ok(Some(entry.url_id))
    }
}
