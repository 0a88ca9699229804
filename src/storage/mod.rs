//! Durable, crash-consistent storage for workflow instances.

pub mod atomic;
pub mod file_lock;
pub mod state_store;

pub use atomic::{write_atomic, write_json_atomic};
pub use file_lock::{FileLock, LockError, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};
pub use state_store::{
    artifact_base_name, FeatureIndex, FileStateStore, IndexEntry, InstanceIndex, PersistenceError,
    StateStore,
};
