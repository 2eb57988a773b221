use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use cumulus_common::{Error, Result};

/// Keyed mutual exclusion over logical resource ids (association ids).
///
/// At most one holder per key at a time; acquisition blocks up to the
/// caller's timeout. The returned guard releases the key when dropped, which
/// covers every exit path of a critical section including errors.
///
/// In-process only: a horizontally scaled orchestrator needs a distributed
/// lock service behind the same surface.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(LockGuard { _guard: guard }),
            Err(_) => Err(Error::LockTimeout {
                key: key.to_string(),
            }),
        }
    }
}
