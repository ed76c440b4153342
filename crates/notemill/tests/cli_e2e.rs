//! CLI end-to-end tests: exit codes, lock conflicts, status and retry flows,
//! all against a stub annotator script and fake daemons.

#![cfg(unix)]

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn notemill_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_notemill"))
}

const STUB: &str = r#"#!/bin/sh
IN="$1"
if grep -q GARBAGE "$IN" 2>/dev/null; then echo "not xml"; exit 0; fi
TEXT=$(cat "$IN")
cat <<EOF
<MMOs><MMO><Phrase>
<PhraseText>$TEXT</PhraseText>
<Candidates><Candidate>
<CandidateScore>1000</CandidateScore>
<CandidateCUI>C0011849</CandidateCUI>
<CandidateMatched>$TEXT</CandidateMatched>
<PositionalInfo>0/17</PositionalInfo>
</Candidate></Candidates>
</Phrase></MMO></MMOs>
EOF
"#;

struct CliHarness {
    _bin_dir: TempDir,
    input_dir: TempDir,
    output_dir: TempDir,
    script: PathBuf,
    _tagger: TcpListener,
    _wsd: TcpListener,
    tagger_port: u16,
    wsd_port: u16,
}

impl CliHarness {
    fn new() -> Self {
        let bin_dir = TempDir::new().unwrap();
        let script = bin_dir.path().join("annotator.sh");
        fs::write(&script, STUB).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tagger = TcpListener::bind("127.0.0.1:0").unwrap();
        let wsd = TcpListener::bind("127.0.0.1:0").unwrap();
        let tagger_port = tagger.local_addr().unwrap().port();
        let wsd_port = wsd.local_addr().unwrap().port();

        Self {
            _bin_dir: bin_dir,
            input_dir: TempDir::new().unwrap(),
            output_dir: TempDir::new().unwrap(),
            script,
            _tagger: tagger,
            _wsd: wsd,
            tagger_port,
            wsd_port,
        }
    }

    fn add_note(&self, name: &str, text: &str) {
        fs::write(self.input_dir.path().join(name), text).unwrap();
    }

    fn notemill(&self, args: &[&str]) -> Output {
        Command::new(notemill_bin())
            .args(args)
            .env("NOTEMILL_TAGGER_PORT", self.tagger_port.to_string())
            .env("NOTEMILL_WSD_PORT", self.wsd_port.to_string())
            .output()
            .expect("failed to run notemill")
    }

    fn process(&self) -> Output {
        self.notemill(&[
            "process",
            self.input_dir.path().to_str().unwrap(),
            self.output_dir.path().to_str().unwrap(),
            "--annotator-bin",
            self.script.to_str().unwrap(),
            "--annotator-options",
            "",
            "--pool-size",
            "2",
            "--per-file-timeout-sec",
            "5",
        ])
    }

    fn output_root(&self) -> &Path {
        self.output_dir.path()
    }
}

#[test]
fn test_process_and_status_happy_path() {
    let harness = CliHarness::new();
    harness.add_note("a.txt", "diabetes mellitus");
    harness.add_note("b.txt", "hypertension");

    let output = harness.process();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    assert!(harness.output_root().join("a.csv").exists());
    assert!(harness.output_root().join("b.csv").exists());
    assert!(harness.output_root().join(".state.json").exists());
    // Lock released after the run.
    assert!(!harness.output_root().join(".state.lock").exists());
    // A run log was written.
    let logs: Vec<_> = fs::read_dir(harness.output_root().join("logs"))
        .unwrap()
        .collect();
    assert!(!logs.is_empty());

    let status = harness.notemill(&["status", harness.output_root().to_str().unwrap(), "--json"]);
    assert_eq!(status.status.code(), Some(0));
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["counts"]["completed"], 2);
    assert_eq!(value["manifest"]["totals"]["completed"], 2);
}

#[test]
fn test_second_process_hits_lock_conflict() {
    let harness = CliHarness::new();
    harness.add_note("a.txt", "note");

    // Hold the run lock as another process would.
    let _guard = notemill_state::try_acquire_run_lock(
        harness.output_root(),
        std::time::Duration::from_secs(3600),
    )
    .unwrap();

    let output = harness.process();
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("locked"), "stderr: {stderr}");
}

#[test]
fn test_missing_annotator_binary_is_config_error() {
    let harness = CliHarness::new();
    harness.add_note("a.txt", "note");
    let output = harness.notemill(&[
        "process",
        harness.input_dir.path().to_str().unwrap(),
        harness.output_root().to_str().unwrap(),
        "--annotator-bin",
        "/no/such/annotator",
    ]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_retry_reprocesses_failed_files() {
    let harness = CliHarness::new();
    harness.add_note("bad.txt", "GARBAGE note");

    let first = harness.process();
    assert_eq!(first.status.code(), Some(0));

    let status = harness.notemill(&[
        "status",
        harness.output_root().to_str().unwrap(),
        "--failed-only",
        "--json",
    ]);
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["failed"].as_array().unwrap().len(), 1);
    assert_eq!(value["failed"][0]["error_kind"], "parse");

    // Fix the input, then retry: the record requeues and completes.
    harness.add_note("bad.txt", "now a clean note");
    let retry = harness.notemill(&[
        "retry",
        harness.output_root().to_str().unwrap(),
        "--annotator-bin",
        harness.script.to_str().unwrap(),
        "--annotator-options",
        "",
    ]);
    assert_eq!(retry.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&retry.stderr));
    assert!(harness.output_root().join("bad.csv").exists());

    let status = harness.notemill(&["status", harness.output_root().to_str().unwrap(), "--json"]);
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["counts"]["completed"], 1);
    assert_eq!(value["counts"]["failed"], 0);
}

#[test]
fn test_resume_without_state_is_config_error() {
    let harness = CliHarness::new();
    let output = harness.notemill(&[
        "resume",
        harness.output_root().to_str().unwrap(),
        "--annotator-bin",
        harness.script.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_server_status_reports_daemon_liveness() {
    let harness = CliHarness::new();
    let output = harness.notemill(&[
        "server",
        "status",
        harness.output_root().to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tagger"));
    assert!(stdout.contains("up"));
}
