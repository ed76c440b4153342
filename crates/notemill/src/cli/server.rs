//! `server`: operator control over the tagger and WSD daemons outside of a
//! batch run.

use crate::cli::{config_error, EXIT_DAEMON, EXIT_OK};
use notemill_engine::server::DaemonSupervisor;
use notemill_protocol::BatchConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, clap::Args)]
pub struct ServerArgs {
    /// Output root whose daemon sidecar to use
    pub output: PathBuf,

    /// Path to the annotator binary (or NOTEMILL_ANNOTATOR_BIN); the daemon
    /// control scripts are expected next to it
    #[arg(long)]
    pub annotator_bin: Option<PathBuf>,

    /// Tagger port override
    #[arg(long)]
    pub tagger_port: Option<u16>,

    /// WSD port override
    #[arg(long)]
    pub wsd_port: Option<u16>,
}

#[derive(Debug, clap::Subcommand)]
pub enum ServerAction {
    /// Start both daemons and wait until their ports accept connections
    Start(ServerArgs),
    /// Stop both daemons via their control scripts
    Stop(ServerArgs),
    /// Probe both daemon ports and report liveness
    Status(ServerArgs),
}

pub fn run(action: ServerAction, _verbose: bool) -> ExitCode {
    match action {
        ServerAction::Start(args) => {
            let config = match build_server_config(&args, true) {
                Ok(config) => config,
                Err(message) => return config_error(message),
            };
            let mut supervisor = DaemonSupervisor::from_config(&config, &args.output);
            match supervisor.ensure_up() {
                Ok(()) => {
                    println!("Daemons up");
                    ExitCode::from(EXIT_OK)
                }
                Err(err) => {
                    eprintln!("Error: {err}");
                    ExitCode::from(EXIT_DAEMON)
                }
            }
        }
        ServerAction::Stop(args) => {
            let config = match build_server_config(&args, true) {
                Ok(config) => config,
                Err(message) => return config_error(message),
            };
            let mut supervisor = DaemonSupervisor::from_config(&config, &args.output);
            supervisor.stop_all();
            println!("Daemons stopped");
            ExitCode::from(EXIT_OK)
        }
        ServerAction::Status(args) => {
            let config = match build_server_config(&args, false) {
                Ok(config) => config,
                Err(message) => return config_error(message),
            };
            let supervisor = DaemonSupervisor::from_config(&config, &args.output);
            let mut all_up = true;
            for status in supervisor.status() {
                println!(
                    "{}: port {} {}",
                    status.name,
                    status.port,
                    if status.up { "up" } else { "down" }
                );
                all_up &= status.up;
            }
            if all_up {
                ExitCode::from(EXIT_OK)
            } else {
                ExitCode::from(EXIT_DAEMON)
            }
        }
    }
}

/// `status` only probes ports, so the binary path is optional there.
fn build_server_config(args: &ServerArgs, need_binary: bool) -> Result<BatchConfig, String> {
    let mut config = BatchConfig::new(PathBuf::new()).apply_env();
    if let Some(bin) = &args.annotator_bin {
        config.annotator_bin = bin.clone();
    }
    if need_binary && config.annotator_bin.as_os_str().is_empty() {
        return Err(
            "no annotator binary configured; pass --annotator-bin or set NOTEMILL_ANNOTATOR_BIN"
                .to_string(),
        );
    }
    if let Some(port) = args.tagger_port {
        config.tagger_port = port;
    }
    if let Some(port) = args.wsd_port {
        config.wsd_port = port;
    }
    Ok(config)
}
