//! Interrupt and abort handling
//!
//! A signal (SIGINT, SIGTERM, SIGHUP) ends the run. The handler:
//! - raises the process-wide abort flag, so the runner never records the
//!   in-flight step even if its action happens to return first
//! - tells the user that progress is preserved and how to resume
//! - terminates step child processes (SIGTERM, then SIGKILL after a grace period)
//! - unmounts every registered target mount, ignoring failures
//! - exits with 128 + signal number
//!
//! The main thread usually notices the flag while the handler is still
//! unmounting; it waits on [`CleanupLatch`] before exiting.
//!
//! Completed steps stay recorded; the interrupted step re-runs from scratch
//! on the next invocation.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static ABORT_FLAG: OnceLock<AbortFlag> = OnceLock::new();
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();
static MOUNT_REGISTRY: OnceLock<Arc<Mutex<MountRegistry>>> = OnceLock::new();
static CLEANUP_LATCH: OnceLock<Arc<CleanupLatch>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL for step children
const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Shared "abort requested" latch
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag raised by the signal handler
    pub fn global() -> Self {
        ABORT_FLAG.get_or_init(AbortFlag::new).clone()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registry of running step scripts, keyed by process group leader PID
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    stopping: bool,
}

/// What `ChildRegistry::terminate_all` had to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Termination {
    /// Step groups signalled
    pub signalled: usize,
    /// Groups still alive after the grace period
    pub killed: usize,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Tracking step process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Step process group {} finished", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Stop every running step: SIGTERM to each group, SIGKILL to the
    /// groups still alive after `grace_period`. Runs once per process.
    pub fn terminate_all(&mut self, grace_period: Duration) -> Termination {
        if std::mem::replace(&mut self.stopping, true) {
            debug!("Step termination already in progress");
            return Termination::default();
        }

        let groups: Vec<u32> = self.pids.drain().collect();
        let mut outcome = Termination {
            signalled: groups.len(),
            killed: 0,
        };
        if groups.is_empty() {
            return outcome;
        }

        info!("Stopping {} step process group(s)", groups.len());
        for &pgid in &groups {
            signal_step(pgid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline && groups.iter().any(|&pgid| is_process_alive(pgid)) {
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pgid in groups.iter().filter(|&&pgid| is_process_alive(pgid)) {
            warn!("Step process group {} survived SIGTERM, killing it", pgid);
            signal_step(pgid, Signal::SIGKILL);
            outcome.killed += 1;
        }
        outcome
    }
}

/// Signal a step's whole group so the tools it started die with it.
/// Falls back to the leader alone if the group is already gone.
fn signal_step(pgid: u32, signal: Signal) {
    let group = Pid::from_raw(-(pgid as i32));
    if let Err(e) = signal::kill(group, signal) {
        debug!("{} to group {} failed ({}), signalling leader", signal, pgid, e);
        let _ = signal::kill(Pid::from_raw(pgid as i32), signal);
    }
}

/// Present and not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State follows the parenthesised command name, which may contain spaces
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| !matches!(state, "Z" | "X")),
        Err(_) => true,
    }
}

/// Set once the signal handler has finished releasing resources.
/// Carries the exit code the process should end with.
#[derive(Debug, Default)]
pub struct CleanupLatch {
    exit_code: Mutex<Option<i32>>,
    done: Condvar,
}

impl CleanupLatch {
    pub fn global() -> Arc<CleanupLatch> {
        CLEANUP_LATCH.get_or_init(|| Arc::new(CleanupLatch::default())).clone()
    }

    pub fn finish(&self, exit_code: i32) {
        let mut slot = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(exit_code);
        self.done.notify_all();
    }

    /// Block until cleanup finished or `timeout` passed
    pub fn wait(&self, timeout: Duration) -> Option<i32> {
        let slot = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, _) = self
            .done
            .wait_timeout_while(slot, timeout, |code| code.is_none())
            .unwrap_or_else(|e| e.into_inner());
        *slot
    }
}

/// Unmount function used during release
pub type Unmounter = fn(&Path) -> io::Result<()>;

/// Target mounts that must be released on abort
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: Vec<PathBuf>,
}

impl MountRegistry {
    pub fn global() -> Arc<Mutex<MountRegistry>> {
        MOUNT_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(MountRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.mounts.contains(&path) {
            debug!("Registered mount {:?}", path);
            self.mounts.push(path);
        }
    }

    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Unmount everything, most recent first. Failures are logged and dropped.
    pub fn release_all(&mut self, unmount: Unmounter) {
        while let Some(path) = self.mounts.pop() {
            match unmount(&path) {
                Ok(()) => info!("Released mount {:?}", path),
                Err(e) => debug!("Ignoring failure to release {:?}: {}", path, e),
            }
        }
    }
}

/// `umount -R <path>`
pub fn umount_recursive(path: &Path) -> io::Result<()> {
    let status = Command::new("umount")
        .arg("-R")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("umount -R exited with {status}")))
    }
}

/// Everything the signal handler needs to leave the host in a safe state
#[derive(Clone)]
pub struct AbortHandler {
    flag: AbortFlag,
    children: Arc<Mutex<ChildRegistry>>,
    mounts: Arc<Mutex<MountRegistry>>,
    unmount: Unmounter,
    state_dir: PathBuf,
    grace_period: Duration,
}

impl AbortHandler {
    /// Handler wired to the process-wide flag and registries
    pub fn global(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            flag: AbortFlag::global(),
            children: ChildRegistry::global(),
            mounts: MountRegistry::global(),
            unmount: umount_recursive,
            state_dir: state_dir.into(),
            grace_period: CHILD_GRACE_PERIOD,
        }
    }

    /// Handler over explicit parts (tests)
    pub fn with_parts(
        flag: AbortFlag,
        children: Arc<Mutex<ChildRegistry>>,
        mounts: Arc<Mutex<MountRegistry>>,
        unmount: Unmounter,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            flag,
            children,
            mounts,
            unmount,
            state_dir: state_dir.into(),
            grace_period: Duration::from_millis(200),
        }
    }

    /// Raise the flag, notify the user, and release resources.
    /// Never fails: the process is already on its way out.
    pub fn abort(&self, reason: &str, out: &mut dyn Write) {
        self.flag.request();
        info!("Abort requested ({}), cleaning up", reason);

        let _ = writeln!(out);
        let _ = writeln!(out, "Interrupted ({reason}). Completed steps are saved in {}.", self.state_dir.display());
        let _ = writeln!(out, "Run `stagerun install` again to resume; the interrupted step will be repeated.");
        let _ = out.flush();

        let stopped = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminate_all(self.grace_period);
        if stopped.killed > 0 {
            let _ = writeln!(
                out,
                "{} of {} step process group(s) ignored SIGTERM and were killed.",
                stopped.killed, stopped.signalled
            );
        }
        self.mounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release_all(self.unmount);
    }
}

/// Install the SIGINT/SIGTERM/SIGHUP handler thread.
/// Call once at program start, before any step runs.
pub fn init_signal_handlers(handler: AbortHandler) -> Result<(), io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let latch = CleanupLatch::global();

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "signal",
            };
            handler.abort(signal_name, &mut io::stderr());
            latch.finish(128 + sig);
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of its own process group, dying with the parent
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(io::Error::other)?;

                // A step must not outlive the driver and keep writing to the disk
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
