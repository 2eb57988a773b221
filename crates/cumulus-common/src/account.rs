use serde::{Deserialize, Serialize};

/// Reserved account owning SYSTEM templates. Operations performed for it
/// never emit usage events.
pub const SYSTEM_ACCOUNT_ID: &str = "system";

/// Privilege tier of an account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Normal,
    DomainAdmin,
    ReadOnlyAdmin,
    ResourceDomainAdmin,
    Admin,
}

impl AccountTier {
    pub fn is_admin(self) -> bool {
        !matches!(self, AccountTier::Normal)
    }
}

/// A caller or resource-owning account. Stored under `/accounts/{account_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    pub tier: AccountTier,
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.tier.is_admin()
    }

    pub fn is_system(&self) -> bool {
        self.account_id == SYSTEM_ACCOUNT_ID
    }
}
