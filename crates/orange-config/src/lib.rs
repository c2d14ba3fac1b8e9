//! Orange Filter Configuration
//!
//! Persisted filter settings, the storage collaborator seam, and the
//! blocked-count statistics kept next to them.
//!
//! Reads never fail: a missing, unreadable or partially malformed document
//! is merged key-by-key onto the defaults.

mod config;
mod storage;
mod stats;

pub use config::{AiMode, FilterConfig, FilterLists, Sensitivity, Settings, Stats, CONFIG_VERSION};
pub use storage::{
    load_config, save_config, FileStorage, MemoryStorage, Storage, StorageChange, StorageError,
};
pub use stats::{get_blocked_count, increment_blocked_count, BlockCounter};
