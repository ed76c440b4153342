//! Annotator invocation: one child process per job.
//!
//! The invoker writes the input text to a unique scratch directory, spawns
//! the annotator with stdout captured to an XML file, and enforces the
//! per-file timeout with a SIGTERM, then SIGKILL after a grace period.
//!
//! Scratch directories live under the diagnostics root so that preserving
//! one on failure is a same-filesystem rename. On success the scratch
//! directory disappears with the [`Invocation`].

use crate::error::JobError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Invoker {
    bin: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    diagnostics_root: PathBuf,
}

/// Result of one successful annotator run. Holds the scratch directory; drop
/// it (or call [`Invocation::preserve`]) when the XML has been consumed.
#[derive(Debug)]
pub struct Invocation {
    pub exit_code: i32,
    pub stdout_xml: PathBuf,
    pub stderr: String,
    pub wall: Duration,
    workdir: TempDir,
}

impl Invocation {
    /// Keep the scratch files for later inspection, keyed by job id.
    pub fn preserve(self, job_id: u64) -> std::io::Result<PathBuf> {
        let root = self
            .workdir
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        preserve_workdir(self.workdir, &root, job_id)
    }
}

impl Invoker {
    pub fn new(
        bin: impl Into<PathBuf>,
        options: &str,
        timeout: Duration,
        kill_grace: Duration,
        diagnostics_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bin: bin.into(),
            args: options.split_whitespace().map(str::to_string).collect(),
            timeout,
            kill_grace,
            diagnostics_root: diagnostics_root.into(),
        }
    }

    /// Run the annotator over `text`. Returns the captured output on a clean
    /// exit; on any failure the scratch directory is preserved under
    /// `diagnostics/<job_id>/` before the error is returned.
    ///
    /// `cancel` is the force-shutdown flag: when it flips mid-run the child
    /// is killed immediately.
    pub fn run(
        &self,
        text: &str,
        job_id: u64,
        cancel: &AtomicBool,
    ) -> Result<Invocation, JobError> {
        fs::create_dir_all(&self.diagnostics_root)?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!(".job-{job_id}-"))
            .tempdir_in(&self.diagnostics_root)?;

        let input_path = workdir.path().join("input.txt");
        let stdout_path = workdir.path().join("stdout.xml");
        let stderr_path = workdir.path().join("stderr.txt");
        fs::write(&input_path, text)?;

        let started = Instant::now();
        let mut child = Command::new(&self.bin)
            .args(&self.args)
            .arg(&input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(fs::File::create(&stdout_path)?))
            .stderr(Stdio::from(fs::File::create(&stderr_path)?))
            .spawn()
            .map_err(|e| {
                let _ = preserve_workdir_ref(&workdir, &self.diagnostics_root, job_id);
                JobError::Io(e)
            })?;

        debug!(
            "[Job {}] Spawned annotator pid={} timeout={}s",
            job_id,
            child.id(),
            self.timeout.as_secs()
        );

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = terminate(&mut child, self.kill_grace);
                    let _ = preserve_workdir(workdir, &self.diagnostics_root, job_id);
                    return Err(JobError::Io(e));
                }
            }

            if cancel.load(Ordering::SeqCst) {
                let _ = terminate(&mut child, Duration::ZERO);
                let _ = preserve_workdir(workdir, &self.diagnostics_root, job_id);
                return Err(JobError::Other("annotator killed by shutdown".into()));
            }

            if started.elapsed() >= self.timeout {
                warn!(
                    "[Job {}] Annotator pid={} exceeded {}s timeout, terminating",
                    job_id,
                    child.id(),
                    self.timeout.as_secs()
                );
                let _ = terminate(&mut child, self.kill_grace);
                let path = preserve_workdir(workdir, &self.diagnostics_root, job_id).ok();
                if let Some(path) = path {
                    debug!("[Job {}] Diagnostics kept at {}", job_id, path.display());
                }
                return Err(JobError::Timeout(self.timeout));
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let wall = started.elapsed();
        let stderr = fs::read(&stderr_path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        if !status.success() {
            let message = format!(
                "annotator exited with {status}: {}",
                tail_of(&stderr, 500)
            );
            let _ = preserve_workdir(workdir, &self.diagnostics_root, job_id);
            return Err(JobError::AnnotatorFailed(message));
        }

        Ok(Invocation {
            exit_code: status.code().unwrap_or(-1),
            stdout_xml: stdout_path,
            stderr,
            wall,
            workdir,
        })
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL. Always reaps.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    child.kill()?;
    let _ = child.wait();
    Ok(())
}

fn preserve_workdir(workdir: TempDir, diagnostics_root: &Path, job_id: u64) -> std::io::Result<PathBuf> {
    let target = diagnostics_root.join(job_id.to_string());
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    let source = workdir.keep();
    fs::rename(&source, &target)?;
    Ok(target)
}

fn preserve_workdir_ref(
    workdir: &TempDir,
    diagnostics_root: &Path,
    job_id: u64,
) -> std::io::Result<PathBuf> {
    let target = diagnostics_root.join(job_id.to_string());
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::create_dir_all(&target)?;
    for entry in fs::read_dir(workdir.path())? {
        let entry = entry?;
        fs::copy(entry.path(), target.join(entry.file_name()))?;
    }
    Ok(target)
}

fn tail_of(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(max.saturating_sub(1)) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}
