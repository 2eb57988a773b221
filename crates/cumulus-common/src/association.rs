use serde::{Deserialize, Serialize};

/// Download state of a template relative to one pool or host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Downloading,
    Downloaded,
    DownloadError,
}

/// Liveness of a host association record.
///
/// The third state of the lifecycle, "absent", is the absence of the record
/// itself. A soft-deleted association keeps its install path so a later copy
/// of the same template can be revived without re-transferring bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Active,
    SoftDeleted,
}

/// Tracks a template's presence in one primary storage pool.
///
/// Stored under `/pool_assocs/{pool_id}/{template_id}`. All writes that can
/// race another writer go through the orchestrator's lock table, keyed by
/// `assoc_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAssociation {
    /// Lock-table key for this association.
    pub assoc_id: String,

    pub pool_id: String,
    pub template_id: String,

    pub state: DownloadState,

    /// Download progress (0–100).
    #[serde(default)]
    pub percent: u32,

    /// Path of the installed image inside the pool. Always set once
    /// `state == Downloaded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    /// Scratch path used by the host that performed the download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_download_path: Option<String>,

    /// Image size in bytes. Always set once `state == Downloaded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Set by the GC sweep; cleared whenever the template is prepared again.
    #[serde(default)]
    pub marked_for_gc: bool,

    #[serde(default)]
    pub created_at_ms: u64,

    #[serde(default)]
    pub updated_at_ms: u64,
}

impl PoolAssociation {
    pub fn new(pool_id: &str, template_id: &str, now_ms: u64) -> Self {
        Self {
            assoc_id: uuid::Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            template_id: template_id.to_string(),
            state: DownloadState::NotDownloaded,
            percent: 0,
            install_path: None,
            local_download_path: None,
            size_bytes: None,
            marked_for_gc: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// Tracks a template's presence on one secondary storage host.
///
/// Stored under `/host_assocs/{host_id}/{template_id}`. Secondary storage is
/// the source of truth consulted before any push into a primary pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAssociation {
    pub assoc_id: String,

    pub host_id: String,
    pub template_id: String,

    pub state: DownloadState,

    #[serde(default)]
    pub percent: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    pub presence: Presence,

    /// This association was (re)created by a cross-zone copy rather than a
    /// direct download.
    #[serde(default)]
    pub copy_requested: bool,

    /// Async job driving the current transfer, if one is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub updated_at_ms: u64,
}

impl HostAssociation {
    pub fn new(host_id: &str, template_id: &str, now_ms: u64) -> Self {
        Self {
            assoc_id: uuid::Uuid::new_v4().to_string(),
            host_id: host_id.to_string(),
            template_id: template_id.to_string(),
            state: DownloadState::NotDownloaded,
            percent: 0,
            install_path: None,
            size_bytes: None,
            presence: Presence::Active,
            copy_requested: false,
            job_id: None,
            error: None,
            updated_at_ms: now_ms,
        }
    }

    /// Usable as a transfer source: fully downloaded and not soft-deleted.
    pub fn is_ready(&self) -> bool {
        self.state == DownloadState::Downloaded && self.presence == Presence::Active
    }
}
