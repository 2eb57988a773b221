pub mod memory;
pub mod types;

pub use memory::MemoryMetaStore;
pub use types::MetaStore;
