use serde::{Deserialize, Serialize};

/// On-disk format of a template's image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    Ova,
    /// Removable/boot media rather than a disk image.
    Iso,
}

impl ImageFormat {
    pub fn is_iso(self) -> bool {
        self == ImageFormat::Iso
    }
}

/// Origin and handling class of a template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Built-in infrastructure template (router, SSVM). Never extractable.
    System,
    /// Lives on compute hosts only, never staged to secondary storage.
    PerHost,
    /// Shipped-with-the-product template visible to users.
    BuiltIn,
    /// Registered by a user account.
    User,
}

/// Hypervisor family a template is registered for.
///
/// `None` is used for ISOs and other artifacts with no hypervisor requirement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorKind {
    XenServer,
    Kvm,
    VmWare,
    BareMetal,
    None,
}

impl HypervisorKind {
    pub fn is_xen_family(self) -> bool {
        self == HypervisorKind::XenServer
    }
}

/// A reusable virtual-machine disk image (or boot ISO) definition.
///
/// Stored under `/templates/{template_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Globally unique template identifier.
    pub template_id: String,

    /// Canonical name used on storage hosts (unique across the fleet).
    pub unique_name: String,

    /// Human-readable display text.
    pub display_text: String,

    pub format: ImageFormat,
    pub kind: TemplateKind,
    pub hypervisor: HypervisorKind,

    /// Visible to accounts other than the owner.
    #[serde(default)]
    pub is_public: bool,

    #[serde(default)]
    pub featured: bool,

    /// Owner has allowed the raw bytes to leave the platform.
    #[serde(default)]
    pub extractable: bool,

    /// Requires hardware virtualization on the target host.
    #[serde(default)]
    pub requires_hvm: bool,

    /// Guest bit-width (32 or 64).
    #[serde(default = "default_bits")]
    pub bits: u32,

    /// Owning account.
    pub account_id: String,

    /// Source URL the image was registered from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    pub guest_os_id: String,

    #[serde(default)]
    pub bootable: bool,

    /// Creation timestamp (ms since epoch).
    #[serde(default)]
    pub created_at_ms: u64,

    /// Soft-delete marker (ms since epoch). A removed template stays
    /// queryable for bookkeeping but is rejected by every operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at_ms: Option<u64>,
}

fn default_bits() -> u32 {
    64
}

impl Template {
    pub fn is_removed(&self) -> bool {
        self.removed_at_ms.is_some()
    }

    /// SYSTEM and PERHOST templates never leave the platform.
    pub fn leaves_platform(&self) -> bool {
        !matches!(self.kind, TemplateKind::System | TemplateKind::PerHost)
    }
}
