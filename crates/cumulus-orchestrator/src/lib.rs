pub mod adapter;
pub mod catalog;
pub mod extract;
pub mod gc;
pub mod lock_table;
pub mod monitor;
pub mod orchestrator;
pub mod permission;
pub mod util;
pub mod vm_manager;

pub use adapter::{
    AdapterRegistry, StockTemplateAdapter, TemplateAdapter, TemplateProfile, TemplateRegistration,
};
pub use catalog::Catalog;
pub use extract::{ExtractMode, Resolver, SystemResolver};
pub use lock_table::{LockGuard, LockTable};
pub use monitor::{
    AgentDownloadMonitor, AgentUploadMonitor, DownloadMonitor, ExtractUrl, UploadMonitor,
};
pub use orchestrator::TemplateOrchestrator;
pub use permission::{AccountService, ResourceKind, StaticAccountService};
pub use vm_manager::{AgentVmManager, VmManager};
