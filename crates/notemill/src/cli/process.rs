//! `process` and `resume`: run a batch under the run lock with signal
//! handling and a progress printer.

use crate::cli::{build_config, config_error, EXIT_DAEMON, EXIT_ERROR, EXIT_INTERRUPTED, EXIT_OK};
use crate::EngineArgs;
use notemill_engine::batch::{BatchError, BatchOutcome, BatchRunner, CancelState};
use notemill_engine::events::ProgressBus;
use notemill_logging::{init_logging, LogConfig};
use notemill_protocol::{BatchConfig, ProgressEvent};
use notemill_state::{try_acquire_run_lock, LockError, StateManager};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub fn run(
    input: &Path,
    output: &Path,
    engine: EngineArgs,
    background: bool,
    verbose: bool,
) -> ExitCode {
    if background {
        return detach();
    }
    let config = match build_config(&engine) {
        Ok(config) => config,
        Err(message) => return config_error(message),
    };
    run_batch(input, output, config, verbose, false)
}

pub fn resume(output: &Path, engine: EngineArgs, verbose: bool) -> ExitCode {
    let input = match recorded_input_dir(output) {
        Ok(input) => input,
        Err(message) => return config_error(message),
    };
    let config = match build_config(&engine) {
        Ok(config) => config,
        Err(message) => return config_error(message),
    };
    run_batch(&input, output, config, verbose, false)
}

pub(crate) fn recorded_input_dir(output: &Path) -> Result<PathBuf, String> {
    let state = StateManager::open(output).map_err(|e| e.to_string())?;
    let snapshot = state.snapshot().map_err(|e| e.to_string())?;
    match snapshot.manifest.input_dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Err(format!(
            "no batch has been recorded at {}; run `process` first",
            output.display()
        )),
    }
}

pub(crate) fn run_batch(
    input: &Path,
    output: &Path,
    config: BatchConfig,
    verbose: bool,
    reset_failed_first: bool,
) -> ExitCode {
    let _lock = match try_acquire_run_lock(output, config.lock_stale_age) {
        Ok(guard) => guard,
        Err(err @ LockError::Held { .. }) => return config_error(err),
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let state = match StateManager::open(output) {
        Ok(state) => state,
        Err(err) => return config_error(err),
    };

    // `retry` mode: requeue failed records with their attempt counter reset
    // before the engine enumerates.
    if reset_failed_first {
        match state.reset_failed_to_pending() {
            Ok(requeued) if requeued.is_empty() => {
                println!("No failed files to retry");
                return ExitCode::from(EXIT_OK);
            }
            Ok(requeued) => println!("Requeued {} failed files", requeued.len()),
            Err(err) => return config_error(err),
        }
    }
    let run_id = state.run_id();
    match init_logging(LogConfig {
        output_root: output,
        run_id: &run_id,
        verbose,
    }) {
        Ok(log_path) => println!("Run {run_id}, log at {}", log_path.display()),
        Err(err) => eprintln!("Warning: file logging disabled: {err}"),
    }

    let cancel = CancelState::new();
    install_signal_handler(Arc::clone(&cancel));

    let bus = Arc::new(ProgressBus::new());
    let done = Arc::new(AtomicBool::new(false));
    let printer = spawn_progress_printer(&bus, Arc::clone(&done));

    let runner = BatchRunner::new(config, Arc::clone(&cancel), Arc::clone(&bus));
    let result = runner.run(input, output, &state);

    done.store(true, Ordering::SeqCst);
    let _ = printer.join();

    match result {
        Ok(outcome) => {
            print_summary(&outcome);
            if outcome.cancelled {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(err @ (BatchError::Supervisor(_) | BatchError::Daemon(_))) => {
            eprintln!("Error: {err}");
            ExitCode::from(EXIT_DAEMON)
        }
        Err(BatchError::Config(message)) => config_error(message),
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Re-exec without `--background`, detached from the terminal. The child
/// takes the run lock itself, so it is not acquired here.
fn detach() -> ExitCode {
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--background")
        .collect();
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("Error: cannot locate own executable: {err}");
            return ExitCode::from(EXIT_ERROR);
        }
    };
    match std::process::Command::new(exe)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => {
            println!("Started background run (pid {})", child.id());
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            eprintln!("Error: failed to detach: {err}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// First signal asks nicely; the second one kills annotator children.
fn install_signal_handler(cancel: Arc<CancelState>) {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        match Signals::new([SIGINT, SIGTERM]) {
            Ok(mut signals) => {
                std::thread::spawn(move || {
                    let mut received = 0u32;
                    for signal in signals.forever() {
                        received += 1;
                        if received == 1 {
                            eprintln!(
                                "Received signal {signal}, finishing in-flight files \
                                 (interrupt again to force)"
                            );
                            cancel.request_cancel();
                        } else {
                            eprintln!("Forcing shutdown");
                            cancel.request_force();
                            break;
                        }
                    }
                });
            }
            Err(err) => warn!("Failed to install signal handler: {err}"),
        }
    }
}

fn spawn_progress_printer(
    bus: &Arc<ProgressBus>,
    done: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let subscription = bus.subscribe();
    std::thread::spawn(move || {
        let mut total = 0u64;
        let mut finished = 0u64;
        loop {
            match subscription.recv_timeout(Duration::from_millis(200)) {
                Some(ProgressEvent::BatchStarted { total_files }) => {
                    total = total_files;
                    println!("Processing {total_files} files");
                }
                Some(ProgressEvent::JobCompleted {
                    path, concepts, ..
                }) => {
                    finished += 1;
                    println!(
                        "[{finished}/{total}] {} ({concepts} concepts)",
                        display_name(&path)
                    );
                }
                Some(ProgressEvent::JobFailed { path, kind, .. }) => {
                    finished += 1;
                    println!("[{finished}/{total}] FAILED {} ({kind})", display_name(&path));
                }
                Some(ProgressEvent::JobRetried {
                    path,
                    attempt,
                    delay_secs,
                    ..
                }) => {
                    println!(
                        "Retrying {} (attempt {attempt} in {delay_secs}s)",
                        display_name(&path)
                    );
                }
                Some(ProgressEvent::BatchCompleted { .. })
                | Some(ProgressEvent::BatchCancelled) => break,
                Some(_) => {}
                None => {
                    if done.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_summary(outcome: &BatchOutcome) {
    println!(
        "Done: {} completed, {} failed, {} retried, {} skipped{}",
        outcome.completed,
        outcome.failed,
        outcome.retried,
        outcome.skipped,
        if outcome.cancelled {
            " (interrupted)"
        } else {
            ""
        }
    );
    if !outcome.failed_files.is_empty() {
        println!("Most recent failures (see `status --failed-only` for all):");
        for failure in outcome.failed_files.iter().rev().take(10) {
            println!("  {} [{}] {}", failure.key, failure.kind, one_line(&failure.error));
        }
    }
}

fn one_line(text: &str) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    match flat.char_indices().nth(160) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}
