//! Persistent run state for the Notemill batch engine.
//!
//! Two concerns live here and nowhere else:
//! - [`lock`]: the cooperative `.state.lock` that keeps two runs from
//!   targeting the same output root
//! - [`store`]: the `.state.json` document (run manifest + per-file records)
//!   written with a write-to-temp, fsync, atomic-rename discipline

pub mod lock;
pub mod store;

pub use lock::{try_acquire_run_lock, LockError, RunLockGuard};
pub use store::{canonical_key, FileRecord, StateError, StateManager, StateSnapshot};
