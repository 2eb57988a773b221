use async_trait::async_trait;
use dashmap::DashMap;

use cumulus_common::{Account, AccountTier, Error, Result};

/// Countable resource kinds subject to per-account quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Template,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Template => write!(f, "template"),
        }
    }
}

/// Account-side authorization and quota bookkeeping.
///
/// The orchestrator performs direct ownership comparisons for normal-tier
/// callers itself; admin-tier callers are delegated here, where domain
/// hierarchy (out of scope for this core) would be consulted.
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn check_access(&self, caller: &Account, owner: &Account) -> Result<()>;

    async fn resource_limit_exceeded(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<bool>;

    async fn increment_resource_count(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<()>;

    async fn decrement_resource_count(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<()>;
}

/// Single-node `AccountService` with fixed per-account limits.
///
/// Every account may operate on its own resources. Full admins pass every
/// access check; other admin tiers may operate on normal-tier accounts only
/// (there is no domain tree here to consult).
#[derive(Default)]
pub struct StaticAccountService {
    counts: DashMap<(String, ResourceKind), u64>,
    limits: DashMap<String, u64>,
    default_limit: Option<u64>,
}

impl StaticAccountService {
    pub fn new(default_limit: Option<u64>) -> Self {
        Self {
            counts: DashMap::new(),
            limits: DashMap::new(),
            default_limit,
        }
    }

    pub fn set_limit(&self, account_id: &str, limit: u64) {
        self.limits.insert(account_id.to_string(), limit);
    }
}

#[async_trait]
impl AccountService for StaticAccountService {
    async fn check_access(&self, caller: &Account, owner: &Account) -> Result<()> {
        if caller.account_id == owner.account_id {
            return Ok(());
        }
        if caller.tier == AccountTier::Admin {
            return Ok(());
        }
        if caller.is_admin() && owner.tier == AccountTier::Normal {
            return Ok(());
        }
        Err(Error::PermissionDenied(format!(
            "account {} may not operate on resources of account {}",
            caller.account_id, owner.account_id
        )))
    }

    async fn resource_limit_exceeded(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<bool> {
        let limit = self
            .limits
            .get(account_id)
            .map(|l| *l)
            .or(self.default_limit);
        let Some(limit) = limit else {
            return Ok(false);
        };
        let count = self
            .counts
            .get(&(account_id.to_string(), resource))
            .map(|c| *c)
            .unwrap_or(0);
        Ok(count >= limit)
    }

    async fn increment_resource_count(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<()> {
        *self
            .counts
            .entry((account_id.to_string(), resource))
            .or_insert(0) += 1;
        Ok(())
    }

    async fn decrement_resource_count(
        &self,
        account_id: &str,
        resource: ResourceKind,
    ) -> Result<()> {
        if let Some(mut count) = self.counts.get_mut(&(account_id.to_string(), resource)) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}
