//! Shared logging utilities for Notemill binaries.
//!
//! Two layers: an append-only per-run file under `<output_root>/logs/` and a
//! filtered stderr layer. The file log is the durable record consulted after
//! a failed batch, so it never carries ANSI escapes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "notemill=info,notemill_engine=info,notemill_state=info";

/// Logging configuration for a single run.
pub struct LogConfig<'a> {
    pub output_root: &'a Path,
    pub run_id: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a per-run append-only file writer and stderr
/// output. Returns the log file path for the startup banner.
pub fn init_logging(config: LogConfig<'_>) -> Result<PathBuf> {
    let log_path = run_log_path(config.output_root, config.run_id);
    let file_writer = SharedFileWriter::open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .ok();

    Ok(log_path)
}

/// `<output_root>/logs/run-<run_id>.log`, creating the directory on demand.
pub fn run_log_path(output_root: &Path, run_id: &str) -> PathBuf {
    output_root
        .join("logs")
        .join(format!("run-{}.log", sanitize_name(run_id)))
}

#[derive(Clone)]
struct SharedFileWriter {
    inner: Arc<Mutex<File>>,
}

impl SharedFileWriter {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedFileGuard {
    inner: Arc<Mutex<File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_path_sanitizes() {
        let root = Path::new("/tmp/out");
        let path = run_log_path(root, "20260802/12:00");
        assert_eq!(path, root.join("logs").join("run-20260802_12_00.log"));
    }

    #[test]
    fn test_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run-x.log");
        let writer = SharedFileWriter::open(&path).unwrap();
        {
            use tracing_subscriber::fmt::MakeWriter;
            let mut guard = writer.make_writer();
            guard.write_all(b"first\n").unwrap();
            let mut guard = writer.make_writer();
            guard.write_all(b"second\n").unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
