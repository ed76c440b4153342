//! `retry`: requeue every failed file with a reset attempt counter and
//! re-engage the batch engine, honoring per-invocation overrides such as a
//! larger timeout.

use crate::cli::{build_config, config_error};
use crate::EngineArgs;
use std::path::Path;
use std::process::ExitCode;

pub fn run(output: &Path, engine: EngineArgs, verbose: bool) -> ExitCode {
    let input = match super::process::recorded_input_dir(output) {
        Ok(input) => input,
        Err(message) => return config_error(message),
    };
    let config = match build_config(&engine) {
        Ok(config) => config,
        Err(message) => return config_error(message),
    };
    super::process::run_batch(&input, output, config, verbose, true)
}
