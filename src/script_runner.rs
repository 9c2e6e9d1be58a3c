//! Step Script Execution
//!
//! Every step action shells out to `<scripts-dir>/<step>.sh`. All script
//! execution goes through `run_step_script` so that:
//!
//! - Each script leads its own process group and dies with the driver
//! - The child PID is registered for cleanup on interrupt
//! - The pipeline context reaches the script only through the environment
//!
//! Passwords are passed as environment variables, never as arguments, and the
//! environment is never logged.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::abort::{ChildRegistry, CommandProcessGroup};

/// Script file for a named step
pub fn script_path(scripts_dir: &Path, name: &str) -> PathBuf {
    scripts_dir.join(format!("{name}.sh"))
}

fn lock_registry(registry: &Arc<Mutex<ChildRegistry>>) -> MutexGuard<'_, ChildRegistry> {
    // A panic elsewhere must not stop us from tracking children
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run `<scripts_dir>/<name>.sh` under bash with `env` added to its environment.
///
/// Returns the captured output for both success and non-zero exit; callers
/// decide with [`ScriptOutput::ensure_success`]. Errors only when the script
/// is missing or cannot be spawned.
pub fn run_step_script(scripts_dir: &Path, name: &str, env: &[(String, String)]) -> Result<ScriptOutput> {
    let path = script_path(scripts_dir, name);
    if !path.is_file() {
        anyhow::bail!("Step script not found: {}", path.display());
    }

    info!("Executing {}", path.display());
    debug!(
        "Script environment keys: {:?}",
        env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
    );

    let mut cmd = Command::new("bash");
    cmd.arg(&path)
        .current_dir(scripts_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .in_new_process_group();

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn script: {}", path.display()))?;
    let pid = child.id();

    let registry = ChildRegistry::global();
    lock_registry(&registry).register(pid);

    let output = child.wait_with_output();
    lock_registry(&registry).unregister(pid);
    let output = output.with_context(|| format!("Failed waiting for script: {name}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();

    for line in stdout.lines() {
        info!(target: "stagerun::script", "[{}] {}", name, line);
    }

    if output.status.success() {
        info!("Script {} executed successfully", name);
    } else {
        warn!("Script {} failed with exit code {}", name, exit_code.unwrap_or(-1));
    }

    Ok(ScriptOutput {
        stdout,
        stderr,
        exit_code,
        success: output.status.success(),
    })
}

/// Output from a script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ScriptOutput {
    /// Check if the script succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        match self.exit_code {
            Some(code) => anyhow::bail!("{} failed (exit code {}): {}", context, code, self.stderr.trim()),
            None => anyhow::bail!("{} killed by signal: {}", context, self.stderr.trim()),
        }
    }
}
