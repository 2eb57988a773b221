use serde::{Deserialize, Serialize};

/// A datacenter zone. Stored under `/zones/{zone_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Holds the zone-scoped canonical copies of templates.
    SecondaryStorage,
    /// Runs VMs and fronts primary storage pools.
    Compute,
}

/// A storage or compute host. Stored under `/hosts/{host_id}`.
///
/// The orchestrator treats hosts as read-mostly reference data; it never
/// creates or mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_id: String,
    pub zone_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,

    pub name: String,

    /// Network address the agent dispatcher connects to.
    pub address: String,

    pub kind: HostKind,

    /// Base URL of the host's storage export (secondary storage hosts).
    /// Its absence on a secondary host is an operator error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
}

/// A primary storage pool. Stored under `/pools/{pool_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub pool_id: String,
    pub zone_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,

    pub name: String,

    /// Address of the storage server backing the pool.
    pub address: String,

    /// Export path on the storage server.
    pub path: String,
}

impl StoragePool {
    /// URL a host mounts to reach this pool's primary storage.
    pub fn storage_url(&self) -> String {
        format!("nfs://{}{}", self.address, self.path)
    }
}

/// Attachment of a compute host to a storage pool.
///
/// Stored under `/pool_hosts/{pool_id}/{host_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHost {
    pub pool_id: String,
    pub host_id: String,

    /// Mount point of the pool on this host.
    pub local_path: String,
}
