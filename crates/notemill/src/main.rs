//! Notemill launcher.
//!
//! Subcommands:
//! - `process <in> <out>`: run a fresh or resumed batch
//! - `resume <out>`: continue the batch recorded at an output root
//! - `status <out>`: summarize state, optionally only failures
//! - `retry <out>`: requeue failed files with a reset attempt counter
//! - `server start|stop|status`: control the tagger/WSD daemons
//!
//! Exit codes: 0 ok, 1 internal error, 2 interrupted, 3 configuration or
//! lock error, 4 daemon failure.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "notemill", about = "Parallel batch annotation of clinical notes")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct EngineArgs {
    /// Path to the annotator binary (or NOTEMILL_ANNOTATOR_BIN)
    #[arg(long)]
    annotator_bin: Option<PathBuf>,

    /// Annotator option string override
    #[arg(long)]
    annotator_options: Option<String>,

    /// Number of annotator instances (default: min(cpus, mem_gb/2))
    #[arg(long)]
    pool_size: Option<usize>,

    /// Per-file timeout in seconds
    #[arg(long)]
    per_file_timeout_sec: Option<u64>,

    /// Maximum attempts per file
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Retry backoff base in seconds
    #[arg(long)]
    retry_base_sec: Option<u64>,

    /// Retry backoff cap in seconds
    #[arg(long)]
    retry_cap_sec: Option<u64>,

    /// Input extension to match (default: txt)
    #[arg(long)]
    input_ext: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a directory of notes into an output root
    Process {
        /// Directory of input notes
        input: PathBuf,
        /// Output root for CSVs, state, and logs
        output: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        /// Detach and run in the background
        #[arg(long)]
        background: bool,
    },

    /// Resume the batch whose state lives at an output root
    Resume {
        output: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print a summary of an output root's state
    Status {
        output: PathBuf,

        /// List failed files with their errors and nothing else
        #[arg(long)]
        failed_only: bool,

        /// Emit the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Requeue failed files with a reset attempt counter
    Retry {
        output: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Control the tagger and WSD daemons
    Server {
        #[command(subcommand)]
        action: cli::server::ServerAction,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    match args.command {
        Commands::Process {
            input,
            output,
            engine,
            background,
        } => cli::process::run(&input, &output, engine, background, args.verbose),
        Commands::Resume { output, engine } => cli::process::resume(&output, engine, args.verbose),
        Commands::Status {
            output,
            failed_only,
            json,
        } => cli::status::run(&output, failed_only, json),
        Commands::Retry { output, engine } => cli::retry::run(&output, engine, args.verbose),
        Commands::Server { action } => cli::server::run(action, args.verbose),
    }
}
