//! Shared vocabulary for the Notemill batch engine.
//!
//! Everything the crates agree on lives here: the concept record produced by
//! the annotator, per-file status values, error classification, progress
//! events, and the immutable run configuration. Nothing in this crate touches
//! the filesystem or spawns processes.

pub mod config;
pub mod defaults;
pub mod events;
pub mod types;

pub use config::BatchConfig;
pub use events::ProgressEvent;
pub use types::{Concept, ErrorKind, FileStatus};
