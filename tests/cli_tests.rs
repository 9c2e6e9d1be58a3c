//! End-to-end tests against the built `stagerun` binary
//!
//! Step scripts are replaced by tiny bash stubs that append their name to a
//! trace file, so a run can be observed without touching any real disk.
//! Pre-flight checks are relaxed through the environment escape hatches.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use stagerun::completion::COMPLETION_LOG_FILE;
use stagerun::installer::{HANDOFF_SCRIPT, STEP_NAMES};
use stagerun::snapshot::SNAPSHOT_FILE;
use tempfile::TempDir;

const CONFIG_JSON: &str = r#"{
    "device": "/dev/vdb",
    "hostname": "forge",
    "username": "ada",
    "user_password": "it's a secret",
    "root_password": "toor",
    "filesystem": "xfs"
}"#;

struct Harness {
    state: TempDir,
    scripts: TempDir,
    mount: TempDir,
    config: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let scripts = TempDir::new().unwrap();
        let config = scripts.path().join("config.json");
        fs::write(&config, CONFIG_JSON).unwrap();

        let harness = Self {
            state: TempDir::new().unwrap(),
            scripts,
            mount: TempDir::new().unwrap(),
            config,
        };
        for name in STEP_NAMES.iter().chain([&HANDOFF_SCRIPT]) {
            harness.script(name, "");
        }
        harness
    }

    /// Replace a stub; `extra` runs after the trace line is written
    fn script(&self, name: &str, extra: &str) {
        let body = format!("echo {name} >> \"$STATE_DIR/trace\"\n{extra}\n");
        fs::write(self.scripts.path().join(format!("{name}.sh")), body).unwrap();
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_stagerun"));
        cmd.arg("--state-dir")
            .arg(self.state.path())
            .arg("--scripts-dir")
            .arg(self.scripts.path())
            .env("STAGERUN_SKIP_ROOT_CHECK", "1")
            .env("STAGERUN_SKIP_NETWORK_CHECK", "1")
            .env("STAGERUN_REQUIRED_TOOLS", "bash")
            .env_remove("RUST_LOG");
        cmd
    }

    fn install(&self) -> Command {
        let mut cmd = self.command();
        cmd.args(["install", "--yes", "--no-reboot", "--config"])
            .arg(&self.config)
            .arg("--mount-root")
            .arg(self.mount.path());
        cmd
    }

    fn trace(&self) -> Vec<String> {
        read_lines(&self.state.path().join("trace"))
    }

    fn clear_trace(&self) {
        let _ = fs::remove_file(self.state.path().join("trace"));
    }

    fn records(&self) -> Vec<String> {
        read_lines(&self.state.path().join(COMPLETION_LOG_FILE))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn records_for(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("{n}=true")).collect()
}

fn run(cmd: &mut Command) -> Output {
    cmd.stdin(Stdio::null()).output().expect("failed to run stagerun")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

// =============================================================================
// Full run and resume
// =============================================================================

#[test]
fn test_full_install_runs_every_step_then_handoff() {
    let h = Harness::new();

    let output = run(&mut h.install());

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let mut expected: Vec<String> = STEP_NAMES.iter().map(|s| s.to_string()).collect();
    expected.push(HANDOFF_SCRIPT.to_string());
    assert_eq!(h.trace(), expected);
    assert_eq!(h.records(), records_for(STEP_NAMES));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Install complete"));
}

#[test]
fn test_failed_step_exits_nonzero_and_resume_continues_there() {
    let h = Harness::new();
    h.script("fetch_base", "echo 'mirror unreachable' >&2; exit 4");

    let output = run(&mut h.install());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("fetch_base"));
    assert_eq!(h.records(), records_for(&STEP_NAMES[..3]));

    h.script("fetch_base", "");
    h.clear_trace();
    let output = run(&mut h.install());

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let mut expected: Vec<String> = STEP_NAMES[3..].iter().map(|s| s.to_string()).collect();
    expected.push(HANDOFF_SCRIPT.to_string());
    assert_eq!(h.trace(), expected);
    assert_eq!(h.records(), records_for(STEP_NAMES));
}

#[test]
fn test_saved_configuration_wins_on_resume() {
    let h = Harness::new();
    h.script("partition_disk", "test \"$INSTALL_DEVICE\" = /dev/vdb || exit 9\nexit 1");

    assert_eq!(run(&mut h.install()).status.code(), Some(1));

    // A different config file is ignored once a snapshot exists
    fs::write(&h.config, CONFIG_JSON.replace("/dev/vdb", "/dev/sdz")).unwrap();
    h.script("partition_disk", "test \"$INSTALL_DEVICE\" = /dev/vdb");
    let output = run(&mut h.install());

    assert!(output.status.success(), "stderr: {}", stderr(&output));
}

#[test]
fn test_snapshot_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let h = Harness::new();
    assert!(run(&mut h.install()).status.success());

    let mode = fs::metadata(h.state.path().join(SNAPSHOT_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_no_persist_secrets_reads_them_again_on_resume() {
    let h = Harness::new();
    h.script("format_partitions", "exit 1");

    let output = run(h.install().arg("--no-persist-secrets"));
    assert_eq!(output.status.code(), Some(1));
    let snapshot = fs::read_to_string(h.state.path().join(SNAPSHOT_FILE)).unwrap();
    assert!(!snapshot.contains("toor"));
    assert!(!snapshot.contains("PASSWORD"));

    h.script("format_partitions", "test \"$ROOT_PASSWORD\" = toor");
    let output = run(h.install().arg("--no-persist-secrets"));
    assert!(output.status.success(), "stderr: {}", stderr(&output));
}

// =============================================================================
// Refusals that must leave no state behind
// =============================================================================

#[test]
fn test_declined_confirmation_changes_nothing() {
    let h = Harness::new();
    let mut child = h
        .command()
        .args(["install", "--no-reboot", "--config"])
        .arg(&h.config)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"no\n").unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("/dev/vdb"));
    assert_eq!(fs::read_dir(h.state.path()).unwrap().count(), 0);
}

#[test]
fn test_preflight_failure_reports_every_problem() {
    let h = Harness::new();
    let output = run(h
        .install()
        .env("STAGERUN_REQUIRED_TOOLS", "bash,definitely_missing_tool_1,definitely_missing_tool_2"));

    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("definitely_missing_tool_1"));
    assert!(err.contains("definitely_missing_tool_2"));
    assert_eq!(fs::read_dir(h.state.path()).unwrap().count(), 0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let h = Harness::new();
    fs::write(&h.config, CONFIG_JSON.replace("forge", "-forge")).unwrap();

    let output = run(&mut h.install());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Hostname"));
    assert!(h.trace().is_empty());
}

// =============================================================================
// Interrupt handling
// =============================================================================

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_sigint_during_step_preserves_progress() {
    let h = Harness::new();
    let started = h.state.path().join("format.started");
    h.script(
        "format_partitions",
        &format!("touch '{}'\nsleep 30", started.display()),
    );

    let child = h
        .install()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    assert!(wait_for(&started, Duration::from_secs(10)), "step never started");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(130));
    assert!(stderr(&output).contains("stagerun install"));
    assert_eq!(h.records(), records_for(&STEP_NAMES[..1]));

    // The next run repeats the interrupted step and finishes
    h.script("format_partitions", "");
    h.clear_trace();
    let output = run(&mut h.install());

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(h.trace().first().map(String::as_str), Some("format_partitions"));
    assert_eq!(h.records(), records_for(STEP_NAMES));
}

#[test]
fn test_sigint_after_mounting_releases_target_mount() {
    use std::os::unix::fs::PermissionsExt;

    let h = Harness::new();
    let bin = h.scripts.path().join("bin");
    let unmounted = h.state.path().join("umount.calls");
    fs::create_dir(&bin).unwrap();
    let fake_umount = bin.join("umount");
    fs::write(
        &fake_umount,
        format!("#!/bin/sh\necho \"$@\" >> '{}'\n", unmounted.display()),
    )
    .unwrap();
    fs::set_permissions(&fake_umount, fs::Permissions::from_mode(0o755)).unwrap();
    let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());

    let started = h.state.path().join("fetch.started");
    h.script("fetch_base", &format!("touch '{}'\nsleep 30", started.display()));

    let child = h
        .install()
        .env("PATH", path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    assert!(wait_for(&started, Duration::from_secs(10)), "fetch_base never started");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(130), "stderr: {}", stderr(&output));
    let fetch = STEP_NAMES.iter().position(|n| *n == "fetch_base").unwrap();
    assert_eq!(h.records(), records_for(&STEP_NAMES[..fetch]));
    let calls = read_lines(&unmounted);
    assert_eq!(calls, vec![format!("-R {}", h.mount.path().display())]);
}

/// Alive means present and not a zombie
fn is_process_alive(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => false,
    }
}

#[test]
fn test_hard_crash_kills_step_and_resumes() {
    let h = Harness::new();
    let pid_file = h.state.path().join("fetch.pid");
    h.script(
        "fetch_base",
        &format!("echo $$ > '{}.tmp'\nmv '{0}.tmp' '{0}'\nexec sleep 30", pid_file.display()),
    );

    let mut child = h
        .install()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    assert!(wait_for(&pid_file, Duration::from_secs(10)), "step never started");
    let step_pid: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

    // SIGKILL cannot be handled: only the parent-death signal cleans up
    kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL).unwrap();
    child.wait().unwrap();

    let start = Instant::now();
    while is_process_alive(step_pid) && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(!is_process_alive(step_pid), "step process {step_pid} outlived the driver");
    assert_eq!(h.records(), records_for(&STEP_NAMES[..3]));

    h.script("fetch_base", "");
    h.clear_trace();
    let output = run(&mut h.install());
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(h.trace().first().map(String::as_str), Some("fetch_base"));
}

// =============================================================================
// Read-only commands
// =============================================================================

#[test]
fn test_status_reports_progress() {
    let h = Harness::new();
    h.script("extract_base", "exit 1");
    run(&mut h.install());

    let output = run(h.command().arg("status"));
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("4/8 complete"));
    assert!(stdout.contains("[x] fetch_base"));
    assert!(stdout.contains("[ ] extract_base"));
}

#[test]
fn test_reset_forces_full_rerun() {
    let h = Harness::new();
    assert!(run(&mut h.install()).status.success());

    assert!(run(h.command().arg("reset")).status.success());
    assert!(h.records().is_empty());
    assert!(h.state.path().join(SNAPSHOT_FILE).exists());

    h.clear_trace();
    assert!(run(&mut h.install()).status.success());
    assert_eq!(h.trace().len(), STEP_NAMES.len() + 1);
}

#[test]
fn test_dry_run_writes_nothing() {
    let h = Harness::new();
    let output = run(h.install().arg("--dry-run"));

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(fs::read_dir(h.state.path()).unwrap().count(), 0);
}

#[test]
fn test_steps_lists_pipeline_order() {
    let h = Harness::new();
    let output = run(h.command().arg("steps"));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let listed: Vec<&str> = stdout
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .collect();
    assert_eq!(listed, STEP_NAMES);
}
