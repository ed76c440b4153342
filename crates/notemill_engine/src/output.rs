//! CSV output writer.
//!
//! One CSV per input file, named after the input stem, terminated by the
//! `# END_OF_FILE` marker line that the state manager treats as completion
//! proof. The file is written to a sibling temp file and renamed into place,
//! so a reader never observes a truncated CSV.
//!
//! Quoting rule: a field is quoted when it contains a comma, quote, newline,
//! or space; embedded quotes are doubled. This is the format the downstream
//! spreadsheets were built around.

use crate::error::JobError;
use notemill_protocol::defaults::{COMPLETION_MARKER, CSV_HEADER};
use notemill_protocol::Concept;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// `<output_root>/<input stem>.csv`
pub fn csv_path(output_root: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_root.join(format!("{stem}.csv"))
}

/// Write the concept sequence for one input file. An empty sequence still
/// produces a header plus marker. Returns the final CSV path.
pub fn write_concepts(
    output_root: &Path,
    input: &Path,
    concepts: &[Concept],
) -> Result<PathBuf, JobError> {
    let path = csv_path(output_root, input);
    fs::create_dir_all(output_root)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".csv.")
        .tempfile_in(output_root)?;
    {
        let file = tmp.as_file_mut();
        write_document(file, concepts)?;
        file.sync_all()?;
    }
    tmp.persist(&path).map_err(|e| JobError::Io(e.error))?;
    Ok(path)
}

fn write_document(w: &mut impl Write, concepts: &[Concept]) -> io::Result<()> {
    writeln!(w, "{}", CSV_HEADER.join(","))?;
    for concept in concepts {
        writeln!(w, "{}", format_row(concept))?;
    }
    writeln!(w, "{COMPLETION_MARKER}")?;
    Ok(())
}

fn format_row(concept: &Concept) -> String {
    let position = match (concept.start, concept.length) {
        (Some(start), Some(length)) => format!("{start}:{length}"),
        _ => String::new(),
    };
    [
        field(&concept.cui),
        field(&concept.score),
        field(&concept.matched),
        field(&concept.preferred_name),
        field(&concept.phrase_text),
        field(&concept.semantic_types.join(":")),
        field(&concept.sources.join("|")),
        field(&position),
    ]
    .join(",")
}

fn field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r', ' ']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Completion proof: the last non-empty line of the CSV is the marker. Only
/// the file tail is read, so the check stays cheap on large outputs.
pub fn has_completion_marker(path: &Path) -> bool {
    const TAIL: i64 = 256;
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let Ok(len) = file.seek(SeekFrom::End(0)) else {
        return false;
    };
    let offset = (len as i64 - TAIL).max(0);
    if file.seek(SeekFrom::Start(offset as u64)).is_err() {
        return false;
    }
    let mut tail = Vec::new();
    if file.read_to_end(&mut tail).is_err() {
        return false;
    }
    // The seek may land mid-codepoint; lossy conversion is fine for a
    // marker-line comparison.
    let tail = String::from_utf8_lossy(&tail);
    tail.trim_end().lines().last() == Some(COMPLETION_MARKER)
}
