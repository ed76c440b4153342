//! `status`: read-only summary of an output root's state document.

use crate::cli::EXIT_OK;
use notemill_protocol::FileStatus;
use notemill_state::StateManager;
use std::path::Path;
use std::process::ExitCode;

pub fn run(output: &Path, failed_only: bool, json: bool) -> ExitCode {
    let snapshot = match StateManager::open(output).and_then(|state| state.snapshot()) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(EXIT_OK);
        }
    };

    if json {
        let failed: Vec<_> = snapshot
            .files
            .iter()
            .filter(|(_, r)| r.status == FileStatus::Failed)
            .map(|(key, r)| {
                serde_json::json!({
                    "path": key,
                    "attempts": r.attempts,
                    "error_kind": r.last_error_kind,
                    "error": r.last_error,
                })
            })
            .collect();
        let value = if failed_only {
            serde_json::json!({ "failed": failed })
        } else {
            serde_json::json!({
                "run_id": snapshot.run_id,
                "manifest": snapshot.manifest,
                "counts": counts(&snapshot.files),
                "failed": failed,
            })
        };
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        return ExitCode::from(EXIT_OK);
    }

    if !failed_only {
        println!("Run: {}", snapshot.run_id);
        println!(
            "Created: {}  Updated: {}",
            snapshot.manifest.created_at, snapshot.manifest.updated_at
        );
        if let Some(input_dir) = &snapshot.manifest.input_dir {
            println!("Input: {input_dir}");
        }
        println!(
            "Pool size: {}  Concepts extracted: {}",
            snapshot.manifest.pool_size, snapshot.manifest.concepts_total
        );
        let by_status = counts(&snapshot.files);
        println!(
            "Files: {} total: {} completed, {} failed, {} pending, {} in progress",
            snapshot.files.len(),
            by_status.completed,
            by_status.failed,
            by_status.pending,
            by_status.in_progress,
        );
        println!(
            "Totals: {} completed, {} failed, {} retried",
            snapshot.manifest.totals.completed,
            snapshot.manifest.totals.failed,
            snapshot.manifest.totals.retried,
        );
    }

    let failed: Vec<_> = snapshot
        .files
        .iter()
        .filter(|(_, r)| r.status == FileStatus::Failed)
        .collect();
    if failed_only || !failed.is_empty() {
        println!("Failed files ({}):", failed.len());
        for (key, record) in failed {
            println!(
                "  {} (attempts {}) [{}] {}",
                key,
                record.attempts,
                record
                    .last_error_kind
                    .map(|k| k.as_str())
                    .unwrap_or("unknown"),
                record.last_error.as_deref().unwrap_or(""),
            );
        }
    }

    ExitCode::from(EXIT_OK)
}

#[derive(serde::Serialize, Default)]
struct StatusCounts {
    pending: u64,
    in_progress: u64,
    completed: u64,
    failed: u64,
}

fn counts(
    files: &std::collections::BTreeMap<String, notemill_state::FileRecord>,
) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for record in files.values() {
        match record.status {
            FileStatus::Pending => counts.pending += 1,
            FileStatus::InProgress => counts.in_progress += 1,
            FileStatus::Completed => counts.completed += 1,
            FileStatus::Failed => counts.failed += 1,
        }
    }
    counts
}
