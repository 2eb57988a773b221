use anyhow::Result;
use async_trait::async_trait;

/// Keyed record storage with per-key revision numbers.
///
/// Every mutation bumps a store-wide revision counter; the revision returned
/// by `get` feeds `compare_and_swap`, which is how callers make
/// check-and-update sequences atomic without holding a lock across the call.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Write a value, returning the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Read a value with the revision it was written at.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List all keys under a prefix, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if the key's current revision equals
    /// `expected_revision` (0 = key must not exist). Returns whether the
    /// swap happened, plus the key's resulting revision.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;
}
