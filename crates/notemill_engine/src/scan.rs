//! Input enumeration.
//!
//! Plain files directly inside the input directory, matching the configured
//! extension, in lexicographic order of their resolved absolute paths so
//! that resume sees the same sequence every run. Subdirectories are not
//! recursed.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn enumerate_inputs(dir: &Path, ext: &str) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("input directory not found: {}", dir.display()),
        ));
    }

    let wanted = ext.trim_start_matches('.');
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .map(|e| e.eq_ignore_ascii_case(wanted))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        // Resolve symlinks so a file is never queued under two names.
        let resolved = std::fs::canonicalize(entry.path())?;
        files.push(resolved);
    }

    files.sort();
    files.dedup();
    Ok(files)
}
