pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use store::{ProviderStateStore, RunStore, StoreError, StoreResult};
pub use types::{CleanupMode, ProviderState, RunStatus, SubagentRun};
