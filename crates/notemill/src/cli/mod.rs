//! CLI command implementations.

pub mod process;
pub mod retry;
pub mod server;
pub mod status;

use crate::EngineArgs;
use notemill_protocol::BatchConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

pub const EXIT_OK: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_INTERRUPTED: u8 = 2;
pub const EXIT_CONFIG: u8 = 3;
pub const EXIT_DAEMON: u8 = 4;

/// Build the immutable run configuration: defaults, then environment, then
/// command-line flags, in that order of precedence.
pub fn build_config(engine: &EngineArgs) -> Result<BatchConfig, String> {
    let mut config = BatchConfig::new(PathBuf::new()).apply_env();

    if let Some(bin) = &engine.annotator_bin {
        config.annotator_bin = bin.clone();
    }
    if config.annotator_bin.as_os_str().is_empty() {
        return Err(
            "no annotator binary configured; pass --annotator-bin or set NOTEMILL_ANNOTATOR_BIN"
                .to_string(),
        );
    }
    if !config.annotator_bin.is_file() {
        return Err(format!(
            "annotator binary not found: {}",
            config.annotator_bin.display()
        ));
    }

    if let Some(options) = &engine.annotator_options {
        config.annotator_options = options.clone();
    }
    if let Some(n) = engine.pool_size {
        config.pool_size = n.max(1);
    }
    if let Some(secs) = engine.per_file_timeout_sec {
        config.per_file_timeout = Duration::from_secs(secs.max(1));
    }
    if let Some(n) = engine.max_attempts {
        config.max_attempts = n.max(1);
    }
    if let Some(secs) = engine.retry_base_sec {
        config.retry_base = Duration::from_secs(secs);
    }
    if let Some(secs) = engine.retry_cap_sec {
        config.retry_cap = Duration::from_secs(secs);
    }
    if let Some(ext) = &engine.input_ext {
        config.input_ext = ext.trim_start_matches('.').to_string();
    }
    Ok(config)
}

pub fn config_error(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("Error: {message}");
    ExitCode::from(EXIT_CONFIG)
}
