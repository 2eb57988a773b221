use serde::{Deserialize, Serialize};

use cumulus_common::ImageFormat;

/// Push a template from secondary storage into a primary pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadToPoolPayload {
    /// Canonical template name on storage hosts.
    pub template_unique_name: String,

    /// Full source URL: the secondary host's storage URL plus the
    /// association's install path.
    pub source_url: String,

    pub format: ImageFormat,
    pub account_id: String,
    pub pool_id: String,

    pub secondary_storage_url: String,
    pub primary_storage_url: String,

    /// Mount point of the pool on the executing host.
    pub local_path: String,
}

/// Remove a template's cached copy from a primary pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyPoolCopyPayload {
    pub pool_id: String,
    pub primary_storage_url: String,

    /// Association being destroyed; the agent uses its install path.
    pub assoc_id: String,
    pub install_path: Option<String>,
}

/// Transfer a template between two secondary storage hosts (cross-zone copy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyToSecondaryPayload {
    pub template_unique_name: String,
    pub source_url: String,
    pub format: ImageFormat,
    pub dest_storage_url: String,
}

/// Fetch a freshly registered template from its origin URL into secondary
/// storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTemplatePayload {
    pub template_unique_name: String,
    pub origin_url: String,
    pub format: ImageFormat,
    pub account_id: String,
    pub dest_storage_url: String,
    pub checksum: Option<String>,
}

/// Push a template's bytes to an external FTP target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadToUrlPayload {
    pub template_unique_name: String,
    pub source_url: String,
    pub target_url: String,
}

/// Attach or detach an ISO on a running VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachIsoPayload {
    pub vm_name: String,
    pub iso_unique_name: String,
    pub iso_source_url: Option<String>,
}

/// Typed payload sent to a host agent. The caller picks the timeout: short
/// for destroy/attach, on the order of hours for bulk transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    DownloadToPool(DownloadToPoolPayload),
    DestroyPoolCopy(DestroyPoolCopyPayload),
    CopyToSecondary(CopyToSecondaryPayload),
    FetchTemplate(FetchTemplatePayload),
    UploadToUrl(UploadToUrlPayload),
    AttachIso(AttachIsoPayload),
    DetachIso(AttachIsoPayload),
}

impl AgentCommand {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentCommand::DownloadToPool(_) => "download_to_pool",
            AgentCommand::DestroyPoolCopy(_) => "destroy_pool_copy",
            AgentCommand::CopyToSecondary(_) => "copy_to_secondary",
            AgentCommand::FetchTemplate(_) => "fetch_template",
            AgentCommand::UploadToUrl(_) => "upload_to_url",
            AgentCommand::AttachIso(_) => "attach_iso",
            AgentCommand::DetachIso(_) => "detach_iso",
        }
    }
}

/// Agent reply. A timeout or transport failure is reported as a failure
/// answer, never as an error escaping the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub result: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Where the image landed (download/copy answers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl AgentAnswer {
    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            install_path: None,
            size_bytes: None,
        }
    }

    pub fn success() -> Self {
        Self {
            result: true,
            details: None,
            install_path: None,
            size_bytes: None,
        }
    }
}
