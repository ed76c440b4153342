//! Supervisor for the part-of-speech tagger and WSD daemons.
//!
//! The annotator needs both network daemons answering before any job can
//! run. `ensure_up` is idempotent: a port that already accepts connections is
//! adopted (assumed externally owned) and never spawned over; otherwise the
//! daemon's control script is run and the port probed with a bounded retry
//! budget. Adopted daemons are never terminated on shutdown.
//!
//! PIDs and ownership land in a sidecar file under the output root so a
//! later run can tell stale daemons from external ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use notemill_protocol::defaults::DAEMON_SIDECAR_NAME;
use notemill_protocol::BatchConfig;

const TAGGER_CONTROL: &str = "skrmedpostctl";
const WSD_CONTROL: &str = "wsdserverctl";

/// How long a control script may run before we assume it stays resident.
const CONTROL_SCRIPT_WAIT: Duration = Duration::from_secs(10);

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start {name} daemon via {script}: {source}")]
    StartFailed {
        name: &'static str,
        script: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{name} daemon on port {port} not reachable after {attempts} probes")]
    Unreachable {
        name: &'static str,
        port: u16,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
struct DaemonSpec {
    name: &'static str,
    port: u16,
    control_script: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnedDaemon {
    name: String,
    port: u16,
    pid: Option<u32>,
    adopted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DaemonSidecar {
    updated_at: DateTime<Utc>,
    daemons: Vec<OwnedDaemon>,
}

#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub name: &'static str,
    pub port: u16,
    pub up: bool,
}

pub struct DaemonSupervisor {
    specs: Vec<DaemonSpec>,
    sidecar_path: PathBuf,
    probe_attempts: u32,
    probe_interval: Duration,
    owned: Vec<OwnedDaemon>,
}

impl DaemonSupervisor {
    /// Control scripts are expected next to the annotator binary unless the
    /// deployment rewires them.
    pub fn from_config(config: &BatchConfig, output_root: &Path) -> Self {
        let scripts_dir = config
            .annotator_bin
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let specs = vec![
            DaemonSpec {
                name: "tagger",
                port: config.tagger_port,
                control_script: scripts_dir.join(TAGGER_CONTROL),
            },
            DaemonSpec {
                name: "wsd",
                port: config.wsd_port,
                control_script: scripts_dir.join(WSD_CONTROL),
            },
        ];
        Self {
            specs,
            sidecar_path: output_root.join(DAEMON_SIDECAR_NAME),
            probe_attempts: config.probe_attempts,
            probe_interval: config.probe_interval,
            owned: Vec::new(),
        }
    }

    /// Bring both daemons up and return once both ports accept connections.
    /// Safe to call repeatedly; already-running daemons are left alone.
    pub fn ensure_up(&mut self) -> Result<(), SupervisorError> {
        for spec in self.specs.clone() {
            if self.owned.iter().any(|d| d.name == spec.name) && probe_port(spec.port) {
                continue;
            }

            if probe_port(spec.port) {
                info!(
                    "{} daemon already listening on port {}, adopting",
                    spec.name, spec.port
                );
                self.record(OwnedDaemon {
                    name: spec.name.to_string(),
                    port: spec.port,
                    pid: None,
                    adopted: true,
                });
                continue;
            }

            let pid = self.spawn_control(&spec, "start")?;
            self.wait_reachable(&spec)?;
            self.record(OwnedDaemon {
                name: spec.name.to_string(),
                port: spec.port,
                pid,
                adopted: false,
            });
        }
        self.write_sidecar();
        Ok(())
    }

    /// Liveness of each daemon by TCP probe.
    pub fn status(&self) -> Vec<DaemonStatus> {
        self.specs
            .iter()
            .map(|spec| DaemonStatus {
                name: spec.name,
                port: spec.port,
                up: probe_port(spec.port),
            })
            .collect()
    }

    /// Stop the daemons this supervisor started. Adopted daemons are not
    /// ours to kill.
    pub fn shutdown(&mut self) {
        for owned in std::mem::take(&mut self.owned) {
            if owned.adopted {
                debug!("Leaving adopted {} daemon alone", owned.name);
                continue;
            }
            let Some(spec) = self.specs.iter().find(|s| s.name == owned.name) else {
                continue;
            };
            info!("Stopping {} daemon on port {}", owned.name, owned.port);
            match Command::new(&spec.control_script).arg("stop").status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(
                    "{} control script exited with {} during stop",
                    owned.name, status
                ),
                Err(e) => warn!("Failed to run {} stop script: {}", owned.name, e),
            }
            #[cfg(unix)]
            if let Some(pid) = owned.pid {
                // Reap a control script that stayed resident.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        self.write_sidecar();
    }

    /// Explicit `server stop`: run both control scripts' stop action no
    /// matter who started the daemons. Used by the operator-facing command,
    /// never by the batch path.
    pub fn stop_all(&mut self) {
        for spec in self.specs.clone() {
            info!("Stopping {} daemon on port {}", spec.name, spec.port);
            match Command::new(&spec.control_script).arg("stop").status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(
                    "{} control script exited with {} during stop",
                    spec.name, status
                ),
                Err(e) => warn!("Failed to run {} stop script: {}", spec.name, e),
            }
        }
        self.owned.clear();
        self.write_sidecar();
    }

    fn spawn_control(
        &self,
        spec: &DaemonSpec,
        action: &str,
    ) -> Result<Option<u32>, SupervisorError> {
        info!(
            "Starting {} daemon: {} {}",
            spec.name,
            spec.control_script.display(),
            action
        );
        let mut child = Command::new(&spec.control_script)
            .arg(action)
            .spawn()
            .map_err(|source| SupervisorError::StartFailed {
                name: spec.name,
                script: spec.control_script.clone(),
                source,
            })?;

        // Most control scripts fork the daemon and exit quickly. One that
        // stays resident is the daemon itself; keep its pid.
        let deadline = Instant::now() + CONTROL_SCRIPT_WAIT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        warn!(
                            "{} control script exited with {} during start",
                            spec.name, status
                        );
                    }
                    return Ok(None);
                }
                Ok(None) if Instant::now() >= deadline => return Ok(Some(child.id())),
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(source) => {
                    return Err(SupervisorError::StartFailed {
                        name: spec.name,
                        script: spec.control_script.clone(),
                        source,
                    })
                }
            }
        }
    }

    fn wait_reachable(&self, spec: &DaemonSpec) -> Result<(), SupervisorError> {
        for attempt in 1..=self.probe_attempts {
            if probe_port(spec.port) {
                info!(
                    "{} daemon reachable on port {} after {} probe(s)",
                    spec.name, spec.port, attempt
                );
                return Ok(());
            }
            std::thread::sleep(self.probe_interval);
        }
        Err(SupervisorError::Unreachable {
            name: spec.name,
            port: spec.port,
            attempts: self.probe_attempts,
        })
    }

    fn record(&mut self, daemon: OwnedDaemon) {
        self.owned.retain(|d| d.name != daemon.name);
        self.owned.push(daemon);
    }

    fn write_sidecar(&self) {
        let sidecar = DaemonSidecar {
            updated_at: Utc::now(),
            daemons: self.owned.clone(),
        };
        let result = serde_json::to_vec_pretty(&sidecar)
            .map_err(io::Error::other)
            .and_then(|bytes| {
                if let Some(parent) = self.sidecar_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.sidecar_path, bytes)
            });
        if let Err(e) = result {
            warn!(
                "Failed to write daemon sidecar {}: {}",
                self.sidecar_path.display(),
                e
            );
        }
    }
}

/// One TCP connect attempt against localhost.
pub fn probe_port(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_CONNECT_TIMEOUT).is_ok()
}
