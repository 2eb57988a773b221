pub mod account;
pub mod association;
pub mod error;
pub mod event;
pub mod telemetry;
pub mod template;
pub mod topology;
pub mod vm;

pub use account::{Account, AccountTier, SYSTEM_ACCOUNT_ID};
pub use association::{DownloadState, HostAssociation, PoolAssociation, Presence};
pub use error::{Error, Result};
pub use event::{UsageEvent, UsageEventKind};
pub use template::{HypervisorKind, ImageFormat, Template, TemplateKind};
pub use topology::{Host, HostKind, PoolHost, StoragePool, Zone};
pub use vm::{Vm, VmState, Volume};
