//! Canonical default values shared across the engine and CLI.

/// Annotator option string used when no override is configured.
///
/// XML output (`--XMLf1`), word-sense disambiguation (`-y`), and negation
/// detection (`--negex`) are required by the downstream CSV schema; the rest
/// mirrors the standard 2020AA deployment.
pub const DEFAULT_ANNOTATOR_OPTIONS: &str =
    "-c -Q 4 -K --sldi -I --XMLf1 --negex -y -Z 2020AA --lexicon db";

pub const DEFAULT_TAGGER_PORT: u16 = 1795;
pub const DEFAULT_WSD_PORT: u16 = 5554;

pub const DEFAULT_PER_FILE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_SECS: u64 = 5;
pub const DEFAULT_RETRY_CAP_SECS: u64 = 60;

pub const DEFAULT_INPUT_EXT: &str = "txt";

/// Files processed before an instance is recycled regardless of health.
pub const DEFAULT_INSTANCE_RECYCLE_LIMIT: u32 = 100;

/// TCP readiness probe budget for the tagger/WSD daemons.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 60;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;

/// Job queue depth as a multiple of the pool size.
pub const DEFAULT_QUEUE_DEPTH_FACTOR: usize = 2;

/// Waiting time for an idle instance before a lease attempt fails.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 30;

/// Grace period between SIGTERM and SIGKILL for a timed-out annotator child.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Lock files older than this are considered abandoned and reclaimed.
pub const DEFAULT_LOCK_STALE_AGE_SECS: u64 = 24 * 60 * 60;

// On-disk layout under the output root.
pub const STATE_FILE_NAME: &str = ".state.json";
pub const STATE_LOCK_NAME: &str = ".state.lock";
pub const DAEMON_SIDECAR_NAME: &str = ".daemons.json";
pub const DIAGNOSTICS_DIR_NAME: &str = "diagnostics";

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Terminal line of every finished CSV; its presence is the completion proof.
pub const COMPLETION_MARKER: &str = "# END_OF_FILE";

pub const CSV_HEADER: [&str; 8] = [
    "CUI",
    "Score",
    "ConceptName",
    "PrefName",
    "Phrase",
    "SemTypes",
    "Sources",
    "Position",
];

// Environment overrides, applied once at configuration construction.
pub const ENV_ANNOTATOR_BIN: &str = "NOTEMILL_ANNOTATOR_BIN";
pub const ENV_ANNOTATOR_OPTIONS: &str = "NOTEMILL_ANNOTATOR_OPTIONS";
pub const ENV_POOL_SIZE: &str = "NOTEMILL_POOL_SIZE";
pub const ENV_TIMEOUT_SECS: &str = "NOTEMILL_TIMEOUT_SECS";
pub const ENV_TAGGER_PORT: &str = "NOTEMILL_TAGGER_PORT";
pub const ENV_WSD_PORT: &str = "NOTEMILL_WSD_PORT";
pub const ENV_BASE_PORT: &str = "NOTEMILL_BASE_PORT";
