//! The single failure funnel for job execution.

use notemill_protocol::ErrorKind;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while processing one file. Each variant maps
/// onto exactly one [`ErrorKind`], which drives retry policy and the state
/// record.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Annotator timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Annotator output unparseable: {0}")]
    Parse(String),

    #[error("Daemon on port {port} unreachable: {message}")]
    DaemonUnreachable { port: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No annotator instance available within {}s", .0.as_secs())]
    PoolExhausted(Duration),

    /// The annotator child died abnormally (non-zero exit or signal). The
    /// instance that ran it is retired.
    #[error("{0}")]
    AnnotatorFailed(String),

    #[error("{0}")]
    Other(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Timeout(_) => ErrorKind::Timeout,
            JobError::Parse(_) => ErrorKind::Parse,
            JobError::DaemonUnreachable { .. } => ErrorKind::DaemonUnreachable,
            JobError::Io(_) => ErrorKind::Io,
            JobError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            JobError::AnnotatorFailed(_) => ErrorKind::Unknown,
            JobError::Other(_) => ErrorKind::Unknown,
        }
    }
}
