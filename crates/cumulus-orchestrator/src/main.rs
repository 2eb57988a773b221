mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cumulus_agent::HttpAgentDispatcher;
use cumulus_common::{telemetry, HypervisorKind};
use cumulus_meta::MemoryMetaStore;
use cumulus_orchestrator::{
    gc, AdapterRegistry, AgentDownloadMonitor, AgentUploadMonitor, AgentVmManager, Catalog,
    StaticAccountService, StockTemplateAdapter, SystemResolver, TemplateOrchestrator,
};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing("cumulus-orchestratord");

    let args = Args::parse();
    info!("cumulus-orchestratord starting...");

    let store = Arc::new(MemoryMetaStore::new());
    let catalog = Catalog::new(store);
    let dispatcher = Arc::new(HttpAgentDispatcher::new());
    let accounts = Arc::new(StaticAccountService::new(args.template_limit));

    let download_monitor = Arc::new(AgentDownloadMonitor::new(
        catalog.clone(),
        dispatcher.clone(),
    ));
    let upload_monitor = Arc::new(AgentUploadMonitor::new(catalog.clone(), dispatcher.clone()));

    let stock = Arc::new(StockTemplateAdapter::new(
        catalog.clone(),
        accounts.clone(),
        download_monitor.clone(),
    ));
    let adapters = AdapterRegistry::new()
        .register(HypervisorKind::XenServer, stock.clone())
        .register(HypervisorKind::Kvm, stock.clone())
        .register(HypervisorKind::VmWare, stock.clone())
        .register(HypervisorKind::BareMetal, stock.clone())
        .register(HypervisorKind::None, stock);

    let vm_manager = Arc::new(AgentVmManager::new(catalog.clone(), dispatcher.clone()));

    let orch = Arc::new(TemplateOrchestrator::new(
        catalog,
        dispatcher,
        adapters,
        accounts,
        download_monitor,
        upload_monitor,
        vm_manager,
        Arc::new(SystemResolver),
    ));

    tokio::spawn(gc::gc_loop(
        orch,
        Duration::from_secs(args.gc_interval_secs),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
