//! Batch coordinator.
//!
//! Owns the job queue and nothing else: instances belong to the pool, child
//! processes to the invoker, persistence to the state manager. Worker
//! threads (one per pool slot) pull jobs from a bounded channel; enumeration
//! blocks when the channel is full, so arbitrarily large input directories
//! never inflate memory.
//!
//! Cancellation is cooperative. The first request stops dispatch and lets
//! in-flight attempts finish under their own timeout; the second kills the
//! annotator children immediately. Either way the state on disk is
//! self-consistent afterwards and resume is legal.

use crate::error::JobError;
use crate::events::ProgressBus;
use crate::invoke::Invoker;
use crate::output;
use crate::pool::{InstancePool, LeaseOutcome};
use crate::retry::RetryPolicy;
use crate::scan;
use crate::server::{probe_port, DaemonSupervisor, SupervisorError};
use crate::mmo;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use notemill_protocol::defaults::DIAGNOSTICS_DIR_NAME;
use notemill_protocol::{BatchConfig, ErrorKind, ProgressEvent};
use notemill_state::{canonical_key, StateError, StateManager};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Daemon outage persisted after restart: {0}")]
    Daemon(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared cancellation flags. `cancel` stops dispatch; `force` additionally
/// kills in-flight annotator children.
#[derive(Debug, Default)]
pub struct CancelState {
    cancel: AtomicBool,
    force: AtomicBool,
}

impl CancelState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_force(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.force.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    fn force_ref(&self) -> &AtomicBool {
        &self.force
    }
}

#[derive(Debug, Clone)]
pub struct FailedFile {
    pub key: String,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub cancelled: bool,
    pub failed_files: Vec<FailedFile>,
}

#[derive(Debug, Clone)]
struct Job {
    id: u64,
    key: String,
    path: PathBuf,
    attempt: u32,
}

/// A retry waiting for its backoff to elapse.
struct Delayed {
    due: Instant,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-due-first.
        other.due.cmp(&self.due)
    }
}

struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    next_job_id: AtomicU64,
    outstanding: Mutex<u64>,
    drained: Condvar,
    failed_files: Mutex<Vec<FailedFile>>,
    abort: Mutex<Option<BatchError>>,
}

impl Counters {
    fn new(outstanding: u64) -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            next_job_id: AtomicU64::new(1),
            outstanding: Mutex::new(outstanding),
            drained: Condvar::new(),
            failed_files: Mutex::new(Vec::new()),
            abort: Mutex::new(None),
        }
    }

    fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    /// One file reached a terminal state (or was abandoned by cancellation).
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock().expect("counter lock poisoned");
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut outstanding = self.outstanding.lock().expect("counter lock poisoned");
        while *outstanding > 0 {
            outstanding = self
                .drained
                .wait(outstanding)
                .expect("counter lock poisoned");
        }
    }
}

struct WorkerCtx<'a> {
    config: &'a BatchConfig,
    state: &'a StateManager,
    pool: &'a InstancePool,
    bus: &'a ProgressBus,
    invoker: &'a Invoker,
    retry: RetryPolicy,
    counters: &'a Counters,
    cancel: &'a CancelState,
    output_root: &'a Path,
    supervisor: &'a Mutex<DaemonSupervisor>,
    daemon_restart_attempted: &'a AtomicBool,
}

impl<'a> WorkerCtx<'a> {
    fn abort(&self, err: BatchError) {
        let mut slot = self.counters.abort.lock().expect("abort lock poisoned");
        if slot.is_none() {
            error!("Aborting batch: {err}");
            *slot = Some(err);
        }
        self.cancel.request_cancel();
    }

    fn aborted(&self) -> bool {
        self.counters
            .abort
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }
}

pub struct BatchRunner {
    config: BatchConfig,
    cancel: Arc<CancelState>,
    bus: Arc<ProgressBus>,
}

impl BatchRunner {
    pub fn new(config: BatchConfig, cancel: Arc<CancelState>, bus: Arc<ProgressBus>) -> Self {
        Self {
            config,
            cancel,
            bus,
        }
    }

    /// Run a fresh or resumed batch over `input_dir` into `output_root`.
    ///
    /// The caller holds the run lock and the state manager; this method owns
    /// everything else (daemons, pool, queue, workers).
    pub fn run(
        &self,
        input_dir: &Path,
        output_root: &Path,
        state: &StateManager,
    ) -> Result<BatchOutcome, BatchError> {
        self.check_fd_limit()?;
        std::fs::create_dir_all(output_root)?;

        let mut supervisor = DaemonSupervisor::from_config(&self.config, output_root);
        supervisor.ensure_up()?;
        let supervisor = Mutex::new(supervisor);

        state.reset_in_progress_to_pending()?;
        state.reconcile_completed(|key| {
            output::has_completion_marker(&output::csv_path(output_root, Path::new(key)))
        })?;

        let inputs = scan::enumerate_inputs(input_dir, &self.config.input_ext)?;
        let keys: Vec<String> = inputs.iter().map(|p| canonical_key(p)).collect();
        state.register_pending(&keys)?;
        state.set_run_params(
            self.config.pool_size as u32,
            input_dir,
            &self.config.annotator_bin,
            self.config.tagger_port,
            self.config.wsd_port,
        )?;

        let todo: Vec<(String, PathBuf)> = keys
            .iter()
            .zip(inputs.iter())
            .filter(|(key, _)| !state.is_completed(key))
            .map(|(key, path)| (key.clone(), path.clone()))
            .collect();
        let skipped = (keys.len() - todo.len()) as u64;
        if skipped > 0 {
            info!("Skipping {skipped} already-completed files");
        }

        info!(
            "Batch start: {} files to process, pool_size={}, timeout={}s",
            todo.len(),
            self.config.pool_size,
            self.config.per_file_timeout.as_secs()
        );
        if let Some(base_port) = self.config.base_port {
            info!("Annotator backends start at port {base_port}");
        }
        self.bus.publish(ProgressEvent::BatchStarted {
            total_files: todo.len() as u64,
        });

        let counters = Counters::new(todo.len() as u64);
        let daemon_restart_attempted = AtomicBool::new(false);
        let pool = InstancePool::new(self.config.pool_size, self.config.instance_recycle_limit);
        let invoker = Invoker::new(
            &self.config.annotator_bin,
            &self.config.annotator_options,
            self.config.per_file_timeout,
            self.config.kill_grace,
            output_root.join(DIAGNOSTICS_DIR_NAME),
        );
        let ctx = WorkerCtx {
            config: &self.config,
            state,
            pool: &pool,
            bus: &self.bus,
            invoker: &invoker,
            retry: RetryPolicy::new(
                self.config.retry_base,
                self.config.retry_cap,
                self.config.max_attempts,
            ),
            counters: &counters,
            cancel: &self.cancel,
            output_root,
            supervisor: &supervisor,
            daemon_restart_attempted: &daemon_restart_attempted,
        };

        std::thread::scope(|scope| {
            let (job_tx, job_rx) = bounded::<Job>(self.config.queue_depth());
            let (retry_tx, retry_rx) = unbounded::<Delayed>();
            let (stop_tx, stop_rx) = bounded::<()>(1);

            for worker_id in 0..self.config.pool_size {
                let job_rx = job_rx.clone();
                let retry_tx = retry_tx.clone();
                let ctx = &ctx;
                scope.spawn(move || worker_loop(ctx, worker_id, job_rx, retry_tx));
            }
            drop(job_rx);
            drop(retry_tx);

            {
                let sched_job_tx = job_tx.clone();
                let ctx = &ctx;
                scope.spawn(move || scheduler_loop(ctx, retry_rx, sched_job_tx, stop_rx));
            }

            // Enumeration backpressure: send blocks while the queue is full.
            for (key, path) in &todo {
                if self.cancel.is_cancelled() {
                    counters.finish_one();
                    continue;
                }
                let job = Job {
                    id: counters.next_job_id(),
                    key: key.clone(),
                    path: path.clone(),
                    attempt: 1,
                };
                if job_tx.send(job).is_err() {
                    counters.finish_one();
                }
            }
            drop(job_tx);

            counters.wait_drained();
            let _ = stop_tx.send(());
        });

        pool.shutdown();

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            // Leave no record in_progress; resume starts clean.
            state.reset_in_progress_to_pending()?;
            self.bus.publish(ProgressEvent::BatchCancelled);
        } else {
            self.bus.publish(ProgressEvent::BatchCompleted {
                completed: counters.completed.load(Ordering::SeqCst),
                failed: counters.failed.load(Ordering::SeqCst),
                retried: counters.retried.load(Ordering::SeqCst),
            });
        }

        supervisor
            .lock()
            .map(|mut s| s.shutdown())
            .unwrap_or_else(|_| warn!("Supervisor lock poisoned during shutdown"));

        if let Ok(mut slot) = counters.abort.lock() {
            if let Some(err) = slot.take() {
                return Err(err);
            }
        }

        let outcome = BatchOutcome {
            completed: counters.completed.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            retried: counters.retried.load(Ordering::SeqCst),
            skipped,
            cancelled,
            failed_files: counters
                .failed_files
                .lock()
                .map(|v| v.clone())
                .unwrap_or_default(),
        };
        info!(
            "Batch finished: {} completed, {} failed, {} retried, {} skipped{}",
            outcome.completed,
            outcome.failed,
            outcome.retried,
            outcome.skipped,
            if outcome.cancelled { " (cancelled)" } else { "" }
        );
        Ok(outcome)
    }

    /// Refuse to start if the file descriptor budget clearly cannot cover
    /// the pool: temp files, child pipes, the state file, daemon sockets.
    fn check_fd_limit(&self) -> Result<(), BatchError> {
        #[cfg(unix)]
        {
            let required = (self.config.pool_size as u64) * 8 + 32;
            if let Some(limit) = fd_limit() {
                if limit < required {
                    return Err(BatchError::Config(format!(
                        "open-file limit {limit} is below the {required} needed for \
                         pool_size={}; raise `ulimit -n` or lower the pool size",
                        self.config.pool_size
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn fd_limit() -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    (rc == 0).then_some(limit.rlim_cur as u64)
}

fn worker_loop(ctx: &WorkerCtx<'_>, worker_id: usize, jobs: Receiver<Job>, retry_tx: Sender<Delayed>) {
    while let Ok(job) = jobs.recv() {
        if ctx.cancel.is_cancelled() {
            ctx.counters.finish_one();
            continue;
        }
        handle_job(ctx, worker_id, job, &retry_tx);
    }
}

fn handle_job(ctx: &WorkerCtx<'_>, worker_id: usize, job: Job, retry_tx: &Sender<Delayed>) {
    let started = Instant::now();
    if let Err(e) = ctx.state.mark_in_progress(&job.key, job.attempt) {
        ctx.abort(BatchError::State(e));
        ctx.counters.finish_one();
        return;
    }
    ctx.bus.publish(ProgressEvent::JobStarted {
        path: job.path.clone(),
        attempt: job.attempt,
    });

    match execute(ctx, &job) {
        Ok(concepts) => {
            let seconds = started.elapsed().as_secs_f64();
            if let Err(e) = ctx.state.mark_completed(&job.key, concepts, seconds) {
                ctx.abort(BatchError::State(e));
                ctx.counters.finish_one();
                return;
            }
            info!(
                "[worker {}] Completed {} ({} concepts, {:.2}s, attempt {})",
                worker_id,
                job.path.display(),
                concepts,
                seconds,
                job.attempt
            );
            ctx.counters.completed.fetch_add(1, Ordering::SeqCst);
            ctx.bus.publish(ProgressEvent::JobCompleted {
                path: job.path.clone(),
                concepts,
                seconds,
            });
            ctx.counters.finish_one();
        }
        Err(err) => {
            let kind = err.kind();
            warn!(
                "[worker {}] Attempt {} on {} failed ({}): {}",
                worker_id,
                job.attempt,
                job.path.display(),
                kind,
                err
            );
            if kind == ErrorKind::DaemonUnreachable {
                handle_daemon_outage(ctx);
            }

            let retriable = ctx.retry.should_retry(kind, job.attempt)
                && !ctx.cancel.is_cancelled()
                && !ctx.aborted();
            if retriable {
                let delay = ctx.retry.backoff(job.attempt);
                ctx.counters.retried.fetch_add(1, Ordering::SeqCst);
                ctx.bus.publish(ProgressEvent::JobRetried {
                    path: job.path.clone(),
                    attempt: job.attempt + 1,
                    kind,
                    delay_secs: delay.as_secs(),
                });
                let successor = Delayed {
                    due: Instant::now() + delay,
                    job: Job {
                        id: ctx.counters.next_job_id(),
                        key: job.key.clone(),
                        path: job.path.clone(),
                        attempt: job.attempt + 1,
                    },
                };
                if retry_tx.send(successor).is_err() {
                    // Scheduler is gone; terminal-fail rather than lose the file.
                    finalize_failure(ctx, &job, kind, &err.to_string());
                }
            } else if ctx.cancel.is_cancelled() && kind.is_retriable() && !ctx.aborted() {
                // Interrupted mid-retry; the record stays recoverable and the
                // end-of-run reset returns it to pending.
                ctx.counters.finish_one();
            } else {
                finalize_failure(ctx, &job, kind, &err.to_string());
            }
        }
    }
}

fn finalize_failure(ctx: &WorkerCtx<'_>, job: &Job, kind: ErrorKind, message: &str) {
    if let Err(e) = ctx.state.mark_failed(&job.key, kind, message) {
        ctx.abort(BatchError::State(e));
    }
    ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut failed) = ctx.counters.failed_files.lock() {
        failed.push(FailedFile {
            key: job.key.clone(),
            kind,
            error: message.to_string(),
        });
    }
    ctx.bus.publish(ProgressEvent::JobFailed {
        path: job.path.clone(),
        kind,
        error: message.to_string(),
    });
    ctx.counters.finish_one();
}

/// One attempt: lease, invoke, parse, write. Returns the concept count.
fn execute(ctx: &WorkerCtx<'_>, job: &Job) -> Result<u64, JobError> {
    let instance = ctx.pool.lease(ctx.config.lease_timeout)?;
    debug!("Job {} running on instance {}", job.id, instance.id());
    let result = run_with_instance(ctx, job);
    let outcome = match &result {
        Ok(_) => LeaseOutcome::Completed,
        Err(JobError::AnnotatorFailed(_)) => LeaseOutcome::Unhealthy,
        Err(e) => LeaseOutcome::Failed(e.kind()),
    };
    ctx.pool.release(instance, outcome);
    result
}

fn run_with_instance(ctx: &WorkerCtx<'_>, job: &Job) -> Result<u64, JobError> {
    let text = std::fs::read_to_string(&job.path)?;

    // Empty notes skip the annotator entirely: header-plus-marker CSV,
    // completed with zero concepts.
    if text.trim().is_empty() {
        output::write_concepts(ctx.output_root, &job.path, &[])?;
        return Ok(0);
    }

    let invocation = ctx
        .invoker
        .run(&text, job.id, ctx.cancel.force_ref())
        .map_err(|e| refine_daemon_error(ctx.config, e))?;

    let concepts = match mmo::parse_file(&invocation.stdout_xml) {
        Ok(concepts) => concepts,
        Err(e) => {
            match invocation.preserve(job.id) {
                Ok(path) => warn!("Diagnostics for job {} kept at {}", job.id, path.display()),
                Err(io_err) => warn!("Failed to preserve diagnostics for job {}: {io_err}", job.id),
            }
            return Err(e);
        }
    };

    output::write_concepts(ctx.output_root, &job.path, &concepts)?;
    Ok(concepts.len() as u64)
}

/// An abnormal annotator exit with a dead daemon port behind it is a daemon
/// outage, not an annotator bug.
fn refine_daemon_error(config: &BatchConfig, err: JobError) -> JobError {
    if let JobError::AnnotatorFailed(message) = &err {
        for port in [config.tagger_port, config.wsd_port] {
            if !probe_port(port) {
                return JobError::DaemonUnreachable {
                    port,
                    message: message.clone(),
                };
            }
        }
    }
    err
}

/// First outage earns one daemon restart; a second outage aborts the batch.
fn handle_daemon_outage(ctx: &WorkerCtx<'_>) {
    if ctx
        .daemon_restart_attempted
        .swap(true, Ordering::SeqCst)
    {
        if !probe_port(ctx.config.tagger_port) || !probe_port(ctx.config.wsd_port) {
            ctx.abort(BatchError::Daemon(
                "daemons unreachable again after the one permitted restart".into(),
            ));
        }
        return;
    }
    warn!("Daemon outage detected, attempting one restart");
    let result = ctx
        .supervisor
        .lock()
        .map_err(|_| BatchError::Daemon("supervisor lock poisoned".into()))
        .and_then(|mut supervisor| supervisor.ensure_up().map_err(BatchError::from));
    if let Err(e) = result {
        ctx.abort(e);
    }
}

/// Holds retries until their backoff elapses, then feeds them back into the
/// job queue. Exits on the stop signal sent once the queue is drained.
fn scheduler_loop(
    ctx: &WorkerCtx<'_>,
    retry_rx: Receiver<Delayed>,
    job_tx: Sender<Job>,
    stop_rx: Receiver<()>,
) {
    let mut heap: BinaryHeap<Delayed> = BinaryHeap::new();
    loop {
        if ctx.cancel.is_cancelled() {
            // Abandoned retries count as finished; their records return to
            // pending during the end-of-run reset.
            for _ in heap.drain() {
                ctx.counters.finish_one();
            }
        }

        let wait = heap
            .peek()
            .map(|next| next.due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(200))
            .min(Duration::from_millis(200));

        crossbeam_channel::select! {
            recv(retry_rx) -> item => {
                if let Ok(item) = item {
                    if ctx.cancel.is_cancelled() {
                        ctx.counters.finish_one();
                    } else {
                        heap.push(item);
                    }
                }
            }
            recv(stop_rx) -> _msg => return,
            default(wait) => {}
        }

        while heap
            .peek()
            .map(|next| next.due <= Instant::now())
            .unwrap_or(false)
        {
            let delayed = heap.pop().expect("peeked entry vanished");
            if job_tx.send(delayed.job).is_err() {
                ctx.counters.finish_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_ordering_is_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        let job = Job {
            id: 0,
            key: "k".into(),
            path: PathBuf::from("k"),
            attempt: 1,
        };
        heap.push(Delayed {
            due: now + Duration::from_secs(20),
            job: job.clone(),
        });
        heap.push(Delayed {
            due: now + Duration::from_secs(5),
            job: job.clone(),
        });
        heap.push(Delayed {
            due: now + Duration::from_secs(10),
            job,
        });
        let first = heap.pop().unwrap();
        assert_eq!(first.due, now + Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_state_escalation() {
        let cancel = CancelState::new();
        assert!(!cancel.is_cancelled());
        cancel.request_cancel();
        assert!(cancel.is_cancelled());
        assert!(!cancel.is_forced());
        cancel.request_force();
        assert!(cancel.is_forced());
    }
}
