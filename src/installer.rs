//! Installer module
//!
//! Wires the production step list, the configuration lifecycle, and the
//! durable stores into one `install` run:
//!
//! 1. Pre-flight checks (nothing is read or written before they pass)
//! 2. Load the saved snapshot, or gather + validate + confirm + save
//! 3. Re-collect passwords when they were not persisted
//! 4. Run the step pipeline against the completion log
//! 5. Handoff: second-stage script, unmount, reboot

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

use crate::abort::{AbortFlag, MountRegistry, umount_recursive};
use crate::completion::{CompletionLog, CompletionStore, MemoryCompletionStore};
use crate::context::PipelineContext;
use crate::error::{InstallError, Result};
use crate::install_config::{ConfigSource, InstallConfig, SECRET_KEYS, missing_keys};
use crate::pipeline::{ActionResult, Pipeline, RunReport, Step, pipeline_tag};
use crate::preflight::Preflight;
use crate::script_runner::{run_step_script, script_path};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};

pub const STEP_PARTITION_DISK: &str = "partition_disk";
pub const STEP_FORMAT_PARTITIONS: &str = "format_partitions";
pub const STEP_MOUNT_FILESYSTEMS: &str = "mount_filesystems";
pub const STEP_FETCH_BASE: &str = "fetch_base";
pub const STEP_EXTRACT_BASE: &str = "extract_base";
pub const STEP_GENERATE_FSTAB: &str = "generate_fstab";
pub const STEP_PREPARE_CHROOT: &str = "prepare_chroot";
pub const STEP_STAGE_SECOND_INSTALLER: &str = "stage_second_installer";

/// Production step list, in execution order
pub const STEP_NAMES: &[&str] = &[
    STEP_PARTITION_DISK,
    STEP_FORMAT_PARTITIONS,
    STEP_MOUNT_FILESYSTEMS,
    STEP_FETCH_BASE,
    STEP_EXTRACT_BASE,
    STEP_GENERATE_FSTAB,
    STEP_PREPARE_CHROOT,
    STEP_STAGE_SECOND_INSTALLER,
];

/// Script run by the handoff before unmount and reboot
pub const HANDOFF_SCRIPT: &str = "handoff";

/// Everything an `install` run needs besides its inputs
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub state_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub mount_root: PathBuf,
    /// Set when `--config` was given (only used to warn on resume)
    pub config_file: Option<PathBuf>,
    /// Skip the destructive-operation confirmation
    pub assume_yes: bool,
    pub persist_secrets: bool,
    pub reboot: bool,
    pub dry_run: bool,
    pub preflight: Preflight,
}

fn config_error(e: anyhow::Error) -> InstallError {
    InstallError::config(format!("{e:#}"))
}

/// Execute a step script, or describe it in dry-run mode
fn run_script_action(scripts_dir: &Path, name: &str, ctx: &PipelineContext, dry_run: bool) -> ActionResult {
    if dry_run {
        info!("[dry-run] Would execute {}", script_path(scripts_dir, name).display());
        return Ok(());
    }
    run_step_script(scripts_dir, name, &ctx.to_env_vars())?.ensure_success(name)
}

fn script_step(name: &'static str, scripts_dir: PathBuf, dry_run: bool) -> Step<PipelineContext> {
    Step::new(name, move |ctx: &mut PipelineContext| {
        // Registered before the script runs so a partial mount is still released on abort
        if name == STEP_MOUNT_FILESYSTEMS && !dry_run {
            register_mount(ctx.mount_root());
        }
        run_script_action(&scripts_dir, name, ctx, dry_run)
    })
}

fn register_mount(path: &Path) {
    let mounts = MountRegistry::global();
    let mut guard = mounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.register(path);
}

fn release_mounts() {
    let mounts = MountRegistry::global();
    let mut guard = mounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.release_all(umount_recursive);
}

fn reboot_system() -> ActionResult {
    info!("Rebooting into the installed system");
    let status = Command::new("reboot")
        .stdin(Stdio::null())
        .status()
        .map_err(|e| anyhow::anyhow!("Failed to run reboot: {e}"))?;
    if !status.success() {
        anyhow::bail!("reboot exited with {status}");
    }
    Ok(())
}

/// Terminal action: second-stage script, unmount, then reboot
fn handoff(scripts_dir: PathBuf, reboot: bool, dry_run: bool) -> impl FnOnce(&mut PipelineContext) -> ActionResult {
    move |ctx: &mut PipelineContext| {
        run_script_action(&scripts_dir, HANDOFF_SCRIPT, ctx, dry_run)?;

        if dry_run {
            info!("[dry-run] Would unmount {} and reboot", ctx.mount_root().display());
            return Ok(());
        }

        release_mounts();

        if reboot {
            reboot_system()
        } else {
            info!("Reboot skipped (--no-reboot); the system is ready for the second stage");
            Ok(())
        }
    }
}

/// The production pipeline over script-backed steps
pub fn build_pipeline(options: &InstallOptions, abort: AbortFlag) -> Result<Pipeline<PipelineContext>> {
    let steps = STEP_NAMES
        .iter()
        .map(|&name| script_step(name, options.scripts_dir.clone(), options.dry_run))
        .collect();
    Ok(Pipeline::new(steps, abort)?.with_handoff(handoff(
        options.scripts_dir.clone(),
        options.reboot,
        options.dry_run,
    )))
}

/// First run: gather, validate, confirm, then persist before any step runs
fn first_run_snapshot(
    options: &InstallOptions,
    store: &SnapshotStore,
    source: &mut dyn ConfigSource,
) -> Result<ConfigSnapshot> {
    let config = source.gather().map_err(config_error)?;
    config.validate().map_err(config_error)?;
    if options.assume_yes {
        info!("Confirmation skipped (--yes) for {}", config.device.trim());
    } else {
        source.confirm(config.device.trim())?;
    }

    let snapshot = config.to_snapshot();
    if options.dry_run {
        info!("[dry-run] Configuration not saved");
        return Ok(snapshot);
    }

    if options.persist_secrets {
        store.save(&snapshot)?;
    } else {
        info!("Passwords will not be saved; they are asked again on resume");
        store.save(&snapshot.without(SECRET_KEYS))?;
    }
    Ok(snapshot)
}

/// Fill password keys a stripped snapshot lacks
fn complete_secrets(mut snapshot: ConfigSnapshot, source: &mut dyn ConfigSource) -> Result<ConfigSnapshot> {
    let missing = missing_keys(&snapshot);
    if missing.iter().any(|key| SECRET_KEYS.contains(key)) {
        let secrets = source.gather_secrets().map_err(config_error)?;
        secrets.apply_to(&mut snapshot);
    }
    Ok(snapshot)
}

/// Run (or resume) the install.
///
/// `source` is only consulted when there is no saved snapshot, or when the
/// saved snapshot lacks passwords. Confirmation is only asked on a fresh run.
pub fn run_install(options: &InstallOptions, source: &mut dyn ConfigSource) -> Result<RunReport> {
    options.preflight.validate()?;

    let snapshots = SnapshotStore::open(&options.state_dir);
    let snapshot = match snapshots.load()? {
        Some(saved) => {
            info!("Resuming with saved configuration from {:?}", snapshots.path());
            if let Some(path) = &options.config_file {
                warn!("Ignoring {:?}: a saved configuration already exists", path);
            }
            saved
        }
        None => first_run_snapshot(options, &snapshots, source)?,
    };
    let snapshot = complete_secrets(snapshot, source)?;

    let config = InstallConfig::from_snapshot(&snapshot).map_err(config_error)?;
    config.validate().map_err(config_error)?;
    let mut ctx = PipelineContext::new(config, &options.mount_root, &options.state_dir);

    let mut pipeline = build_pipeline(options, AbortFlag::global())?;
    let mut log = CompletionLog::open(&options.state_dir);

    let report = if options.dry_run {
        let mut preview = MemoryCompletionStore::seeded_from(&log)?;
        pipeline.run(&mut preview, &mut ctx)?
    } else {
        // Mounts from an earlier run in this boot still need releasing on abort
        if log.is_done(STEP_MOUNT_FILESYSTEMS)? {
            register_mount(&options.mount_root);
        }
        pipeline.run(&mut log, &mut ctx)?
    };

    info!("Install finished: {}", report);
    Ok(report)
}

/// Progress of the production pipeline as recorded on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state_dir: PathBuf,
    pub snapshot_saved: bool,
    pub secrets_saved: bool,
    pub tag_matches: Option<bool>,
    /// Saved configuration with password values masked
    pub settings: Vec<(String, String)>,
    /// Each production step and whether it is recorded
    pub steps: Vec<(String, bool)>,
    /// Recorded names that are not production steps
    pub unknown: Vec<String>,
}

impl StatusReport {
    pub fn completed(&self) -> usize {
        self.steps.iter().filter(|(_, done)| *done).count()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.steps.len()
    }

    /// First step a resume would run
    pub fn next_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|(_, done)| !*done)
            .map(|(name, _)| name.as_str())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State directory: {}", self.state_dir.display())?;
        let snapshot = match (self.snapshot_saved, self.secrets_saved) {
            (false, _) => "none",
            (true, true) => "saved",
            (true, false) => "saved (passwords not persisted)",
        };
        writeln!(f, "Configuration:   {snapshot}")?;
        for (key, value) in &self.settings {
            writeln!(f, "  {key}={value}")?;
        }
        if self.tag_matches == Some(false) {
            writeln!(f, "Pipeline:        recorded for a different step list, run `stagerun reset`")?;
        }
        writeln!(f, "Steps:           {}/{} complete", self.completed(), self.steps.len())?;
        let next = self.next_step();
        for (name, done) in &self.steps {
            let marker = if next == Some(name.as_str()) { "  <- next" } else { "" };
            writeln!(f, "  [{}] {}{}", if *done { "x" } else { " " }, name, marker)?;
        }
        for name in &self.unknown {
            writeln!(f, "  [?] {name} (not part of this pipeline)")?;
        }
        Ok(())
    }
}

/// Read-only view of the state directory
pub fn status(state_dir: &Path) -> Result<StatusReport> {
    let log = CompletionLog::open(state_dir);
    let snapshot = SnapshotStore::open(state_dir).load()?;

    let recorded = log.recorded()?;
    let tag_matches = log
        .pipeline_tag()?
        .map(|stored| stored == pipeline_tag(STEP_NAMES));

    Ok(StatusReport {
        state_dir: state_dir.to_path_buf(),
        snapshot_saved: snapshot.is_some(),
        secrets_saved: snapshot
            .as_ref()
            .is_some_and(|s| SECRET_KEYS.iter().all(|key| s.contains_key(key))),
        tag_matches,
        settings: snapshot
            .iter()
            .flat_map(|s| s.iter())
            .map(|(key, value)| {
                let shown = if SECRET_KEYS.contains(&key) { "********" } else { value };
                (key.to_string(), shown.to_string())
            })
            .collect(),
        steps: STEP_NAMES
            .iter()
            .map(|name| (name.to_string(), recorded.iter().any(|r| r == name)))
            .collect(),
        unknown: recorded
            .into_iter()
            .filter(|r| !STEP_NAMES.contains(&r.as_str()))
            .collect(),
    })
}

/// Forget recorded progress; with `all`, forget the saved configuration too
pub fn reset(state_dir: &Path, all: bool) -> Result<()> {
    CompletionLog::open(state_dir).reset()?;
    info!("Cleared completion records in {:?}", state_dir);
    if all {
        SnapshotStore::open(state_dir).remove()?;
        info!("Removed saved configuration in {:?}", state_dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install_config::{KEY_ROOT_PASSWORD, KEY_USER_PASSWORD, Secrets};
    use std::fs;
    use tempfile::TempDir;

    struct FixedSource {
        config: InstallConfig,
        gathered: usize,
        secrets_asked: usize,
        confirmations: usize,
        decline: bool,
    }

    impl FixedSource {
        fn new() -> Self {
            Self {
                config: InstallConfig {
                    device: "/dev/vdb".to_string(),
                    hostname: "forge".to_string(),
                    username: "ada".to_string(),
                    user_password: "user-pw".to_string(),
                    root_password: "root-pw".to_string(),
                    ..Default::default()
                },
                gathered: 0,
                secrets_asked: 0,
                confirmations: 0,
                decline: false,
            }
        }
    }

    impl ConfigSource for FixedSource {
        fn gather(&mut self) -> anyhow::Result<InstallConfig> {
            self.gathered += 1;
            Ok(self.config.clone())
        }

        fn gather_secrets(&mut self) -> anyhow::Result<Secrets> {
            self.secrets_asked += 1;
            Ok(Secrets {
                user_password: "user-pw".to_string(),
                root_password: "root-pw".to_string(),
            })
        }

        fn confirm(&mut self, device: &str) -> Result<()> {
            self.confirmations += 1;
            if self.decline {
                return Err(InstallError::ConfirmationDeclined {
                    device: device.to_string(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        state: TempDir,
        scripts: TempDir,
        mount: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                state: TempDir::new().unwrap(),
                scripts: TempDir::new().unwrap(),
                mount: TempDir::new().unwrap(),
            };
            for name in STEP_NAMES.iter().chain([&HANDOFF_SCRIPT]) {
                fs::write(
                    script_path(fixture.scripts.path(), name),
                    format!("echo {name} >> \"$STATE_DIR/trace\"\n"),
                )
                .unwrap();
            }
            fixture
        }

        fn options(&self) -> InstallOptions {
            InstallOptions {
                state_dir: self.state.path().to_path_buf(),
                scripts_dir: self.scripts.path().to_path_buf(),
                mount_root: self.mount.path().to_path_buf(),
                config_file: None,
                assume_yes: false,
                persist_secrets: true,
                reboot: false,
                dry_run: false,
                preflight: Preflight {
                    require_root: false,
                    network_probe: None,
                    required_tools: vec![],
                },
            }
        }

        fn trace(&self) -> Vec<String> {
            fs::read_to_string(self.state.path().join("trace"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_fresh_install_runs_every_step_then_handoff() {
        let fx = Fixture::new();
        let mut source = FixedSource::new();

        let report = run_install(&fx.options(), &mut source).unwrap();

        assert_eq!(report.executed, STEP_NAMES);
        let mut expected: Vec<String> = STEP_NAMES.iter().map(|s| s.to_string()).collect();
        expected.push(HANDOFF_SCRIPT.to_string());
        assert_eq!(fx.trace(), expected);
        assert!(SnapshotStore::open(fx.state.path()).exists());
    }

    #[test]
    fn test_resume_skips_recorded_steps_and_does_not_gather() {
        let fx = Fixture::new();
        let opts = fx.options();
        let mut source = FixedSource::new();
        run_install(&opts, &mut source).unwrap();
        fs::remove_file(fx.state.path().join("trace")).unwrap();

        let report = run_install(&opts, &mut source).unwrap();

        assert!(report.executed.is_empty());
        assert_eq!(report.skipped.len(), STEP_NAMES.len());
        assert_eq!(source.gathered, 1);
        assert_eq!(source.confirmations, 1);
        assert_eq!(fx.trace(), vec![HANDOFF_SCRIPT]);
    }

    #[test]
    fn test_declined_confirmation_writes_nothing() {
        let fx = Fixture::new();
        let mut source = FixedSource::new();
        source.decline = true;

        let err = run_install(&fx.options(), &mut source).unwrap_err();

        assert!(matches!(err, InstallError::ConfirmationDeclined { .. }));
        assert_eq!(fs::read_dir(fx.state.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_confirmation() {
        let fx = Fixture::new();
        let mut source = FixedSource::new();
        source.config.hostname = "bad host".to_string();

        let err = run_install(&fx.options(), &mut source).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
        assert_eq!(source.confirmations, 0);
    }

    #[test]
    fn test_assume_yes_skips_confirmation() {
        let fx = Fixture::new();
        let mut opts = fx.options();
        opts.assume_yes = true;
        let mut source = FixedSource::new();
        source.decline = true;

        run_install(&opts, &mut source).unwrap();
        assert_eq!(source.confirmations, 0);
    }

    #[test]
    fn test_failed_step_stops_and_is_not_recorded() {
        let fx = Fixture::new();
        fs::write(script_path(fx.scripts.path(), STEP_FETCH_BASE), "exit 7\n").unwrap();
        let mut source = FixedSource::new();

        let err = run_install(&fx.options(), &mut source).unwrap_err();

        assert!(matches!(err, InstallError::StepAction { ref step, .. } if step == STEP_FETCH_BASE));
        let log = CompletionLog::open(fx.state.path());
        assert_eq!(
            log.recorded().unwrap(),
            vec![STEP_PARTITION_DISK, STEP_FORMAT_PARTITIONS, STEP_MOUNT_FILESYSTEMS]
        );
    }

    #[test]
    fn test_unpersisted_secrets_are_gathered_on_resume() {
        let fx = Fixture::new();
        let mut opts = fx.options();
        opts.persist_secrets = false;
        fs::write(script_path(fx.scripts.path(), STEP_FETCH_BASE), "exit 1\n").unwrap();

        let mut source = FixedSource::new();
        run_install(&opts, &mut source).unwrap_err();

        let saved = SnapshotStore::open(fx.state.path()).load().unwrap().unwrap();
        assert!(!saved.contains_key(KEY_USER_PASSWORD));
        assert!(!saved.contains_key(KEY_ROOT_PASSWORD));
        assert_eq!(source.secrets_asked, 0);

        fs::write(
            script_path(fx.scripts.path(), STEP_FETCH_BASE),
            "test \"$ROOT_PASSWORD\" = root-pw\n",
        )
        .unwrap();
        run_install(&opts, &mut source).unwrap();
        assert_eq!(source.secrets_asked, 1);
        assert_eq!(source.gathered, 1);
    }

    #[test]
    fn test_dry_run_executes_and_persists_nothing() {
        let fx = Fixture::new();
        let mut opts = fx.options();
        opts.dry_run = true;
        let mut source = FixedSource::new();

        let report = run_install(&opts, &mut source).unwrap();

        assert_eq!(report.executed.len(), STEP_NAMES.len());
        assert!(fx.trace().is_empty());
        assert_eq!(fs::read_dir(fx.state.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_status_and_reset() {
        let fx = Fixture::new();
        fs::write(script_path(fx.scripts.path(), STEP_MOUNT_FILESYSTEMS), "exit 1\n").unwrap();
        let mut source = FixedSource::new();
        run_install(&fx.options(), &mut source).unwrap_err();

        let report = status(fx.state.path()).unwrap();
        assert!(report.snapshot_saved);
        assert!(report.secrets_saved);
        assert_eq!(report.tag_matches, Some(true));
        assert_eq!(report.completed(), 2);
        assert!(!report.is_complete());
        assert_eq!(report.next_step(), Some(STEP_MOUNT_FILESYSTEMS));
        let shown = report.to_string();
        assert!(shown.contains("[x] partition_disk"));
        assert!(shown.contains("[ ] mount_filesystems  <- next"));
        assert!(shown.contains("HOSTNAME=forge"));
        assert!(shown.contains("ROOT_PASSWORD=********"));
        assert!(!shown.contains("root-pw"));

        reset(fx.state.path(), false).unwrap();
        let report = status(fx.state.path()).unwrap();
        assert_eq!(report.completed(), 0);
        assert_eq!(report.tag_matches, None);
        assert!(report.snapshot_saved);

        reset(fx.state.path(), true).unwrap();
        assert!(!status(fx.state.path()).unwrap().snapshot_saved);
    }

    #[test]
    fn test_status_lists_unknown_records() {
        let state = TempDir::new().unwrap();
        let mut log = CompletionLog::open(state.path());
        log.mark_done("legacy_step").unwrap();
        log.mark_done(STEP_PARTITION_DISK).unwrap();

        let report = status(state.path()).unwrap();
        assert_eq!(report.unknown, vec!["legacy_step"]);
        assert_eq!(report.completed(), 1);
    }
}
