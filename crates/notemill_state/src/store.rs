//! The `.state.json` document: run manifest plus one record per input file.
//!
//! All mutations happen under an in-process mutex and are flushed with a
//! write-to-temp, fsync, atomic-rename discipline, so a reader never observes
//! a torn document. Cross-process exclusion is the lock module's job.
//!
//! Other components never get a live reference to the document: reads go
//! through [`StateManager::snapshot`] (deep copy) and writes through the
//! explicit `mark_*` methods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use notemill_protocol::defaults::{STATE_FILE_NAME, STATE_SCHEMA_VERSION};
use notemill_protocol::{ErrorKind, FileStatus};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("State file {path} is not a valid state document: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to persist state file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("State lock poisoned")]
    Poisoned,
}

/// Per-file status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub status: FileStatus,
    pub attempts: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub concepts: Option<u64>,
    pub seconds: Option<f64>,
}

impl FileRecord {
    fn pending() -> Self {
        Self {
            status: FileStatus::Pending,
            attempts: 0,
            last_error_kind: None,
            last_error: None,
            last_attempt_at: None,
            concepts: None,
            seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pool_size: u32,
    pub totals: Totals,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub concepts_total: u64,
    #[serde(default)]
    pub input_dir: Option<String>,
    #[serde(default)]
    pub annotator_bin: Option<String>,
    #[serde(default)]
    pub tagger_port: Option<u16>,
    #[serde(default)]
    pub wsd_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    schema: u32,
    run_id: String,
    manifest: Manifest,
    // BTreeMap keeps serialization order stable across rewrites.
    files: BTreeMap<String, FileRecord>,
}

/// Deep copy of the document handed to readers.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub run_id: String,
    pub manifest: Manifest,
    pub files: BTreeMap<String, FileRecord>,
}

pub struct StateManager {
    state_path: PathBuf,
    inner: Mutex<StateDocument>,
}

impl StateManager {
    /// Open (or create) the state document for an output root. A missing
    /// file is an empty state; a present-but-unreadable file is an error
    /// rather than something to silently overwrite.
    pub fn open(output_root: &Path) -> Result<Self, StateError> {
        let state_path = output_root.join(STATE_FILE_NAME);
        let doc = match fs::read_to_string(&state_path) {
            Ok(content) => {
                serde_json::from_str::<StateDocument>(&content).map_err(|source| {
                    StateError::Corrupt {
                        path: state_path.clone(),
                        source,
                    }
                })?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let now = Utc::now();
                StateDocument {
                    schema: STATE_SCHEMA_VERSION,
                    run_id: new_run_id(),
                    manifest: Manifest {
                        created_at: now,
                        updated_at: now,
                        pool_size: 0,
                        totals: Totals::default(),
                        total_files: 0,
                        concepts_total: 0,
                        input_dir: None,
                        annotator_bin: None,
                        tagger_port: None,
                        wsd_port: None,
                    },
                    files: BTreeMap::new(),
                }
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: state_path,
                    source,
                })
            }
        };
        Ok(Self {
            state_path,
            inner: Mutex::new(doc),
        })
    }

    pub fn run_id(&self) -> String {
        self.inner
            .lock()
            .map(|doc| doc.run_id.clone())
            .unwrap_or_default()
    }

    /// Record run parameters in the manifest at batch start.
    pub fn set_run_params(
        &self,
        pool_size: u32,
        input_dir: &Path,
        annotator_bin: &Path,
        tagger_port: u16,
        wsd_port: u16,
    ) -> Result<(), StateError> {
        self.mutate(|doc| {
            doc.manifest.pool_size = pool_size;
            doc.manifest.input_dir = Some(input_dir.display().to_string());
            doc.manifest.annotator_bin = Some(annotator_bin.display().to_string());
            doc.manifest.tagger_port = Some(tagger_port);
            doc.manifest.wsd_port = Some(wsd_port);
        })
    }

    /// Ensure a pending record exists for every enumerated input file and
    /// refresh the total count. Existing records keep their status.
    pub fn register_pending(&self, keys: &[String]) -> Result<(), StateError> {
        self.mutate(|doc| {
            for key in keys {
                doc.files
                    .entry(key.clone())
                    .or_insert_with(FileRecord::pending);
            }
            doc.manifest.total_files = doc.files.len() as u64;
        })
    }

    pub fn mark_in_progress(&self, key: &str, attempt: u32) -> Result<(), StateError> {
        self.mutate(|doc| {
            let record = doc
                .files
                .entry(key.to_string())
                .or_insert_with(FileRecord::pending);
            record.status = FileStatus::InProgress;
            record.attempts = attempt;
            record.last_attempt_at = Some(Utc::now());
            if attempt > 1 {
                doc.manifest.totals.retried += 1;
            }
        })
    }

    /// Idempotent: completing an already-completed file changes nothing.
    pub fn mark_completed(&self, key: &str, concepts: u64, seconds: f64) -> Result<(), StateError> {
        self.mutate(|doc| {
            let record = doc
                .files
                .entry(key.to_string())
                .or_insert_with(FileRecord::pending);
            if record.status == FileStatus::Completed {
                return;
            }
            record.status = FileStatus::Completed;
            record.attempts = record.attempts.max(1);
            record.last_error = None;
            record.last_error_kind = None;
            record.concepts = Some(concepts);
            record.seconds = Some(seconds);
            doc.manifest.totals.completed += 1;
            doc.manifest.concepts_total += concepts;
        })
    }

    pub fn mark_failed(&self, key: &str, kind: ErrorKind, error: &str) -> Result<(), StateError> {
        self.mutate(|doc| {
            let record = doc
                .files
                .entry(key.to_string())
                .or_insert_with(FileRecord::pending);
            if record.status != FileStatus::Failed {
                doc.manifest.totals.failed += 1;
            }
            record.status = FileStatus::Failed;
            record.last_error_kind = Some(kind);
            record.last_error = Some(error.to_string());
            record.last_attempt_at = Some(Utc::now());
        })
    }

    pub fn is_completed(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|doc| {
                doc.files
                    .get(key)
                    .map(|r| r.status == FileStatus::Completed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<FileRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|doc| doc.files.get(key).cloned())
    }

    pub fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let doc = self.inner.lock().map_err(|_| StateError::Poisoned)?;
        Ok(StateSnapshot {
            run_id: doc.run_id.clone(),
            manifest: doc.manifest.clone(),
            files: doc.files.clone(),
        })
    }

    /// Startup recovery: anything an interrupted run left `in_progress` goes
    /// back to `pending`. Returns the number of records reverted.
    pub fn reset_in_progress_to_pending(&self) -> Result<usize, StateError> {
        let mut reverted = 0;
        self.mutate(|doc| {
            for record in doc.files.values_mut() {
                if record.status == FileStatus::InProgress {
                    record.status = FileStatus::Pending;
                    reverted += 1;
                }
            }
        })?;
        if reverted > 0 {
            warn!("Reverted {reverted} in-progress records to pending after unclean shutdown");
        }
        Ok(reverted)
    }

    /// `retry` batch mode: requeue every failed record with a reset attempt
    /// counter. Returns the keys requeued.
    pub fn reset_failed_to_pending(&self) -> Result<Vec<String>, StateError> {
        let mut requeued = Vec::new();
        self.mutate(|doc| {
            for (key, record) in doc.files.iter_mut() {
                if record.status == FileStatus::Failed {
                    record.status = FileStatus::Pending;
                    record.attempts = 0;
                    requeued.push(key.clone());
                    doc.manifest.totals.failed = doc.manifest.totals.failed.saturating_sub(1);
                }
            }
        })?;
        Ok(requeued)
    }

    /// Demote completed records whose on-disk proof no longer holds. The
    /// predicate receives the file key and returns whether the output CSV
    /// exists and carries the completion marker.
    pub fn reconcile_completed(
        &self,
        proof: impl Fn(&str) -> bool,
    ) -> Result<usize, StateError> {
        let mut demoted = 0;
        self.mutate(|doc| {
            for (key, record) in doc.files.iter_mut() {
                if record.status == FileStatus::Completed && !proof(key) {
                    record.status = FileStatus::Pending;
                    record.concepts = None;
                    record.seconds = None;
                    doc.manifest.totals.completed =
                        doc.manifest.totals.completed.saturating_sub(1);
                    demoted += 1;
                }
            }
        })?;
        if demoted > 0 {
            warn!("Demoted {demoted} completed records missing their output CSV");
        }
        Ok(demoted)
    }

    fn mutate(&self, f: impl FnOnce(&mut StateDocument)) -> Result<(), StateError> {
        let mut doc = self.inner.lock().map_err(|_| StateError::Poisoned)?;
        f(&mut doc);
        doc.manifest.updated_at = Utc::now();
        self.persist(&doc)
    }

    /// Write-to-temp, fsync, atomic-rename. A crash at any point leaves
    /// either the old document or the new one, never a mix.
    fn persist(&self, doc: &StateDocument) -> Result<(), StateError> {
        let dir = self
            .state_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let persist_err = |source: io::Error| StateError::Persist {
            path: self.state_path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(persist_err)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".state.json.")
            .tempfile_in(dir)
            .map_err(persist_err)?;
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| persist_err(io::Error::new(io::ErrorKind::Other, e)))?;
        tmp.write_all(&bytes).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&self.state_path)
            .map_err(|e| persist_err(e.error))?;
        debug!("Persisted state ({} records)", doc.files.len());
        Ok(())
    }
}

/// Canonical key for a file: the absolute, symlink-resolved path. The same
/// file is never tracked under two keys.
pub fn canonical_key(path: &Path) -> String {
    match fs::canonicalize(path) {
        Ok(resolved) => resolved.display().to_string(),
        Err(_) => {
            // File may be gone; fall back to a normalized absolute path.
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.to_path_buf())
            };
            absolute.display().to_string()
        }
    }
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StateManager {
        StateManager::open(dir.path()).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        let snap = state.snapshot().unwrap();
        assert!(snap.files.is_empty());
        assert_eq!(snap.manifest.totals, Totals::default());
    }

    #[test]
    fn test_mark_transitions_persist() {
        let dir = TempDir::new().unwrap();
        {
            let state = open(&dir);
            state.register_pending(&["/notes/a.txt".into()]).unwrap();
            state.mark_in_progress("/notes/a.txt", 1).unwrap();
            state.mark_completed("/notes/a.txt", 12, 3.5).unwrap();
        }
        // Reopen from disk.
        let state = open(&dir);
        let record = state.get("/notes/a.txt").unwrap();
        assert_eq!(record.status, FileStatus::Completed);
        assert_eq!(record.concepts, Some(12));
        assert_eq!(record.attempts, 1);
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.manifest.totals.completed, 1);
        assert_eq!(snap.manifest.concepts_total, 12);
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_in_progress("/notes/a.txt", 1).unwrap();
        state.mark_completed("/notes/a.txt", 5, 1.0).unwrap();
        state.mark_completed("/notes/a.txt", 5, 1.0).unwrap();
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.manifest.totals.completed, 1);
        assert_eq!(snap.manifest.concepts_total, 5);
    }

    #[test]
    fn test_reset_in_progress() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_in_progress("/notes/a.txt", 2).unwrap();
        state.mark_in_progress("/notes/b.txt", 1).unwrap();
        state.mark_completed("/notes/b.txt", 0, 0.1).unwrap();
        assert_eq!(state.reset_in_progress_to_pending().unwrap(), 1);
        assert_eq!(state.get("/notes/a.txt").unwrap().status, FileStatus::Pending);
        assert_eq!(
            state.get("/notes/b.txt").unwrap().status,
            FileStatus::Completed
        );
    }

    #[test]
    fn test_reset_failed_clears_attempts() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_in_progress("/notes/a.txt", 3).unwrap();
        state
            .mark_failed("/notes/a.txt", ErrorKind::Timeout, "annotator timed out")
            .unwrap();
        let requeued = state.reset_failed_to_pending().unwrap();
        assert_eq!(requeued, vec!["/notes/a.txt".to_string()]);
        let record = state.get("/notes/a.txt").unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(record.attempts, 0);
        // Error text is kept for the audit trail.
        assert_eq!(record.last_error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_reconcile_demotes_unproven_completions() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_completed("/notes/a.txt", 3, 1.0).unwrap();
        state.mark_completed("/notes/b.txt", 4, 1.0).unwrap();
        let demoted = state.reconcile_completed(|key| key.ends_with("b.txt")).unwrap();
        assert_eq!(demoted, 1);
        assert_eq!(state.get("/notes/a.txt").unwrap().status, FileStatus::Pending);
        assert_eq!(
            state.get("/notes/b.txt").unwrap().status,
            FileStatus::Completed
        );
        let snap = state.snapshot().unwrap();
        assert_eq!(snap.manifest.totals.completed, 1);
    }

    #[test]
    fn test_failed_totals_do_not_double_count() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state
            .mark_failed("/notes/a.txt", ErrorKind::Io, "unreadable")
            .unwrap();
        state
            .mark_failed("/notes/a.txt", ErrorKind::Io, "still unreadable")
            .unwrap();
        assert_eq!(state.snapshot().unwrap().manifest.totals.failed, 1);
    }

    #[test]
    fn test_document_on_disk_matches_schema() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_in_progress("/notes/a.txt", 1).unwrap();
        let raw = fs::read_to_string(dir.path().join(STATE_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schema"], 1);
        assert!(value["run_id"].is_string());
        assert!(value["manifest"]["created_at"].is_string());
        assert_eq!(value["files"]["/notes/a.txt"]["status"], "in_progress");
        assert_eq!(value["files"]["/notes/a.txt"]["attempts"], 1);
        assert!(value["files"]["/notes/a.txt"]["last_error"].is_null());
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE_NAME), "{ not json").unwrap();
        assert!(matches!(
            StateManager::open(dir.path()),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_retried_total_counts_second_attempts() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir);
        state.mark_in_progress("/notes/a.txt", 1).unwrap();
        state.mark_in_progress("/notes/a.txt", 2).unwrap();
        state.mark_in_progress("/notes/a.txt", 3).unwrap();
        assert_eq!(state.snapshot().unwrap().manifest.totals.retried, 2);
    }
}
