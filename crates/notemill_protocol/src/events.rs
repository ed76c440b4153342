//! Progress events published by the batch coordinator.
//!
//! Consumers (CLI progress printer, monitors) subscribe through the engine's
//! progress bus. Delivery is at-least-once per subscriber; slow subscribers
//! lose the oldest events first.

use crate::types::ErrorKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        total_files: u64,
    },
    JobStarted {
        path: PathBuf,
        attempt: u32,
    },
    JobCompleted {
        path: PathBuf,
        concepts: u64,
        seconds: f64,
    },
    JobRetried {
        path: PathBuf,
        attempt: u32,
        kind: ErrorKind,
        delay_secs: u64,
    },
    JobFailed {
        path: PathBuf,
        kind: ErrorKind,
        error: String,
    },
    BatchCompleted {
        completed: u64,
        failed: u64,
        retried: u64,
    },
    BatchCancelled,
}
