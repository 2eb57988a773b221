use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// Single-node, in-memory `MetaStore`.
///
/// Good enough for one orchestrator process; a deployment that scales the
/// orchestrator horizontally needs a shared backend behind the same trait.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = Self::next_revision(&mut inner);
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.kv.remove(key).is_some();
        if existed {
            Self::next_revision(&mut inner);
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (k, (v, rev)) in inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            out.push((k.clone(), v.clone(), *rev));
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;
        let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current_rev != expected_revision {
            return Ok((false, current_rev));
        }
        let rev = Self::next_revision(&mut inner);
        inner.kv.insert(key.to_string(), (value, rev));
        Ok((true, rev))
    }
}
