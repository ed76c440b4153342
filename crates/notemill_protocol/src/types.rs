//! Core record types: file status, error classification, and the concept
//! record emitted by the annotator output parser.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persistent per-file processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FileStatus {
    pub const ALL: [FileStatus; 4] = [
        FileStatus::Pending,
        FileStatus::InProgress,
        FileStatus::Completed,
        FileStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a job failure. Retry decisions hang off this enum and
/// nothing else; every failure in the engine funnels through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Parse,
    DaemonUnreachable,
    Io,
    PoolExhausted,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parse => "parse",
            ErrorKind::DaemonUnreachable => "daemon_unreachable",
            ErrorKind::Io => "io",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// A `parse` failure is deterministic: the input or the annotator output
    /// is structurally bad and will fail the same way on every attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ErrorKind::Parse)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ErrorKind::Timeout),
            "parse" => Ok(ErrorKind::Parse),
            "daemon_unreachable" => Ok(ErrorKind::DaemonUnreachable),
            "io" => Ok(ErrorKind::Io),
            "pool_exhausted" => Ok(ErrorKind::PoolExhausted),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// One annotated concept with character positions and provenance.
///
/// Positions are zero-based character offsets into the source text. Optional
/// fields stay `None` when the annotator output omits them; the parser never
/// fails a job over a missing optional field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Concept {
    /// Concept unique identifier (e.g. `C0011849`).
    pub cui: String,
    /// Candidate score, kept verbatim as the annotator printed it.
    pub score: String,
    /// Surface form the annotator matched.
    pub matched: String,
    /// Preferred name from the vocabulary; falls back to the matched text.
    pub preferred_name: String,
    /// Text of the nearest enclosing phrase.
    pub phrase_text: String,
    pub semantic_types: Vec<String>,
    pub sources: Vec<String>,
    pub start: Option<u32>,
    pub length: Option<u32>,
    pub phrase_start: Option<u32>,
    pub phrase_length: Option<u32>,
    pub utterance_id: Option<u32>,
    pub negated: bool,
    /// True when the concept came from the mapping list rather than the
    /// candidate list.
    pub is_mapping: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in FileStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: FileStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn test_error_kind_retriability() {
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::DaemonUnreachable.is_retriable());
        assert!(ErrorKind::Io.is_retriable());
        assert!(ErrorKind::PoolExhausted.is_retriable());
        assert!(ErrorKind::Unknown.is_retriable());
        assert!(!ErrorKind::Parse.is_retriable());
    }

    #[test]
    fn test_error_kind_str_round_trip() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Parse,
            ErrorKind::DaemonUnreachable,
            ErrorKind::Io,
            ErrorKind::PoolExhausted,
            ErrorKind::Unknown,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("flaky".parse::<ErrorKind>().is_err());
    }
}
