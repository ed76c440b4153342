//! Run configuration.
//!
//! A `BatchConfig` is built once at startup, has environment overrides folded
//! in at construction time, and is passed by reference from there on. Nothing
//! mutates it after `finalize()`.

use crate::defaults;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Path to the annotator binary. The daemon control scripts are expected
    /// next to it unless overridden.
    pub annotator_bin: PathBuf,
    /// Raw option string, split on whitespace when building argv.
    pub annotator_options: String,
    pub pool_size: usize,
    pub per_file_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Input extension without the leading dot.
    pub input_ext: String,
    pub tagger_port: u16,
    pub wsd_port: u16,
    /// First annotator port when a deployment runs several annotator
    /// backends. Recorded for the manifest; the engine probes only the
    /// shared tagger/WSD pair.
    pub base_port: Option<u16>,
    pub instance_recycle_limit: u32,
    pub queue_depth_factor: usize,
    pub lease_timeout: Duration,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub kill_grace: Duration,
    pub lock_stale_age: Duration,
    pub background: bool,
}

impl BatchConfig {
    pub fn new(annotator_bin: impl Into<PathBuf>) -> Self {
        Self {
            annotator_bin: annotator_bin.into(),
            annotator_options: defaults::DEFAULT_ANNOTATOR_OPTIONS.to_string(),
            pool_size: default_pool_size(),
            per_file_timeout: Duration::from_secs(defaults::DEFAULT_PER_FILE_TIMEOUT_SECS),
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(defaults::DEFAULT_RETRY_BASE_SECS),
            retry_cap: Duration::from_secs(defaults::DEFAULT_RETRY_CAP_SECS),
            input_ext: defaults::DEFAULT_INPUT_EXT.to_string(),
            tagger_port: defaults::DEFAULT_TAGGER_PORT,
            wsd_port: defaults::DEFAULT_WSD_PORT,
            base_port: None,
            instance_recycle_limit: defaults::DEFAULT_INSTANCE_RECYCLE_LIMIT,
            queue_depth_factor: defaults::DEFAULT_QUEUE_DEPTH_FACTOR,
            lease_timeout: Duration::from_secs(defaults::DEFAULT_LEASE_TIMEOUT_SECS),
            probe_attempts: defaults::DEFAULT_PROBE_ATTEMPTS,
            probe_interval: Duration::from_millis(defaults::DEFAULT_PROBE_INTERVAL_MS),
            kill_grace: Duration::from_secs(defaults::DEFAULT_KILL_GRACE_SECS),
            lock_stale_age: Duration::from_secs(defaults::DEFAULT_LOCK_STALE_AGE_SECS),
            background: false,
        }
    }

    /// Fold environment overrides in. Called exactly once, before the config
    /// is handed to the coordinator; runtime re-reads of the environment are
    /// deliberately impossible.
    pub fn apply_env(mut self) -> Self {
        if let Some(bin) = env_string(defaults::ENV_ANNOTATOR_BIN) {
            self.annotator_bin = PathBuf::from(bin);
        }
        if let Some(opts) = env_string(defaults::ENV_ANNOTATOR_OPTIONS) {
            self.annotator_options = opts;
        }
        if let Some(n) = env_parse::<usize>(defaults::ENV_POOL_SIZE) {
            self.pool_size = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>(defaults::ENV_TIMEOUT_SECS) {
            self.per_file_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(port) = env_parse::<u16>(defaults::ENV_TAGGER_PORT) {
            self.tagger_port = port;
        }
        if let Some(port) = env_parse::<u16>(defaults::ENV_WSD_PORT) {
            self.wsd_port = port;
        }
        if let Some(port) = env_parse::<u16>(defaults::ENV_BASE_PORT) {
            self.base_port = Some(port);
        }
        self
    }

    /// Queue capacity for the dispatch channel.
    pub fn queue_depth(&self) -> usize {
        (self.pool_size * self.queue_depth_factor).max(1)
    }
}

/// `min(logical CPUs, available memory GB / 2)`, at least 1. Each annotator
/// child holds the full lexicon in memory, so memory is the usual limiter.
pub fn default_pool_size() -> usize {
    let cpus = num_cpus::get();
    let by_memory = available_memory_gb()
        .map(|gb| (gb / 2.0) as usize)
        .unwrap_or(cpus);
    cpus.min(by_memory).max(1)
}

/// Available system memory in GB, read from /proc/meminfo on Linux. Returns
/// `None` on platforms or containers where the file is absent.
fn available_memory_gb() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / (1024.0 * 1024.0));
        }
    }
    None
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::new("/opt/annotator/bin/metamap");
        assert_eq!(config.per_file_timeout, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.tagger_port, 1795);
        assert_eq!(config.wsd_port, 5554);
        assert_eq!(config.input_ext, "txt");
        assert!(config.pool_size >= 1);
        assert_eq!(config.queue_depth(), config.pool_size * 2);
    }

    #[test]
    fn test_env_overrides() {
        // Env mutation is process-global; keep every override in one test.
        std::env::set_var(defaults::ENV_POOL_SIZE, "7");
        std::env::set_var(defaults::ENV_TIMEOUT_SECS, "120");
        std::env::set_var(defaults::ENV_TAGGER_PORT, "2795");
        let config = BatchConfig::new("/opt/annotator/bin/metamap").apply_env();
        std::env::remove_var(defaults::ENV_POOL_SIZE);
        std::env::remove_var(defaults::ENV_TIMEOUT_SECS);
        std::env::remove_var(defaults::ENV_TAGGER_PORT);

        assert_eq!(config.pool_size, 7);
        assert_eq!(config.per_file_timeout, Duration::from_secs(120));
        assert_eq!(config.tagger_port, 2795);
        assert_eq!(config.wsd_port, defaults::DEFAULT_WSD_PORT);
    }

    #[test]
    fn test_garbage_env_is_ignored() {
        std::env::set_var(defaults::ENV_WSD_PORT, "not-a-port");
        let config = BatchConfig::new("/opt/annotator/bin/metamap").apply_env();
        std::env::remove_var(defaults::ENV_WSD_PORT);
        assert_eq!(config.wsd_port, defaults::DEFAULT_WSD_PORT);
    }
}
