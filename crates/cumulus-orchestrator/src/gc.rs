use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cumulus_common::Result;

use crate::orchestrator::TemplateOrchestrator;
use crate::util::now_ms;

/// Counters for the pool garbage collector.
#[derive(Default)]
pub struct GcMetrics {
    pub sweeps: AtomicU64,
    pub marked: AtomicU64,
    pub evicted: AtomicU64,
}

/// One garbage-collection sweep over every pool.
///
/// Two-phase: an unused cached template is first marked, and only evicted on
/// a later sweep if it is still unused and still marked. A prepare call in
/// between clears the mark, so anything that became wanted again survives.
pub async fn sweep(orch: &TemplateOrchestrator, metrics: &GcMetrics) -> Result<()> {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);

    for pool in orch.catalog().list_pools().await? {
        let unused = orch.unused_templates_in_pool(&pool.pool_id).await?;
        for mut assoc in unused {
            if assoc.marked_for_gc {
                debug!(
                    template_id = %assoc.template_id,
                    pool_id = %pool.pool_id,
                    "evicting template unused for two sweeps"
                );
                orch.evict_from_pool(&pool.pool_id, &assoc.template_id)
                    .await?;
                metrics.evicted.fetch_add(1, Ordering::Relaxed);
            } else {
                assoc.marked_for_gc = true;
                assoc.updated_at_ms = now_ms();
                orch.catalog().save_pool_assoc(&assoc).await?;
                metrics.marked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    Ok(())
}

/// Periodic GC driver, spawned once at startup.
pub async fn gc_loop(orch: Arc<TemplateOrchestrator>, interval: Duration) {
    let metrics = GcMetrics::default();
    info!(interval_secs = interval.as_secs(), "pool GC loop starting");
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = sweep(&orch, &metrics).await {
            warn!(error = %e, "GC sweep failed");
            continue;
        }
        info!(
            sweeps = metrics.sweeps.load(Ordering::Relaxed),
            marked = metrics.marked.load(Ordering::Relaxed),
            evicted = metrics.evicted.load(Ordering::Relaxed),
            "GC sweep finished"
        );
    }
}
