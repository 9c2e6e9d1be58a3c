//! Pre-flight checks for the runtime environment
//!
//! Verified on every invocation, before any state is loaded or written:
//! - Running with root privileges (EUID 0)
//! - Network reachability (TCP connect to a probe address)
//! - Required external tools are on PATH
//!
//! All checks always run so the user sees every problem at once.

use std::env;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::InstallError;

/// Tools the step scripts and the abort path depend on
pub const REQUIRED_TOOLS: &[&str] = &[
    "bash",      // Step script interpreter
    "sgdisk",    // GPT partitioning (gptfdisk)
    "partprobe", // Re-read partition table (parted)
    "mount",     // util-linux
    "umount",    // util-linux
    "tar",       // Package-base extraction
    "curl",      // Package-base download
    "chroot",    // coreutils
];

/// Default reachability probe (Cloudflare DNS over HTTPS port)
pub const DEFAULT_NETWORK_PROBE: &str = "1.1.1.1:443";

const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

pub const ENV_SKIP_ROOT_CHECK: &str = "STAGERUN_SKIP_ROOT_CHECK";
pub const ENV_SKIP_NETWORK_CHECK: &str = "STAGERUN_SKIP_NETWORK_CHECK";
pub const ENV_REQUIRED_TOOLS: &str = "STAGERUN_REQUIRED_TOOLS";
pub const ENV_NETWORK_PROBE: &str = "STAGERUN_NETWORK_PROBE";

/// A single unmet precondition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("root privileges required")]
    NotRoot,

    #[error("no network connectivity ({probe}: {reason})")]
    Offline { probe: String, reason: String },

    #[error("missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),
}

/// Configured set of environment checks
#[derive(Debug, Clone)]
pub struct Preflight {
    pub require_root: bool,
    /// `host:port` to connect to, or `None` to skip the network check
    pub network_probe: Option<String>,
    pub required_tools: Vec<String>,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            require_root: true,
            network_probe: Some(DEFAULT_NETWORK_PROBE.to_string()),
            required_tools: REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Preflight {
    /// Defaults adjusted by the developer escape hatches in the environment
    pub fn from_env() -> Self {
        let mut preflight = Self::default();

        if env_flag(ENV_SKIP_ROOT_CHECK) {
            warn!("Root check skipped ({}=1)", ENV_SKIP_ROOT_CHECK);
            preflight.require_root = false;
        }

        if env_flag(ENV_SKIP_NETWORK_CHECK) {
            warn!("Network check skipped ({}=1)", ENV_SKIP_NETWORK_CHECK);
            preflight.network_probe = None;
        } else if let Ok(probe) = env::var(ENV_NETWORK_PROBE) {
            preflight.network_probe = Some(probe);
        }

        if let Ok(tools) = env::var(ENV_REQUIRED_TOOLS) {
            warn!("Required tool list overridden ({}={})", ENV_REQUIRED_TOOLS, tools);
            preflight.required_tools = tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        preflight
    }

    /// Run every check and collect all failures
    pub fn check_all(&self) -> Vec<ValidationError> {
        let mut failures = Vec::new();

        if self.require_root && !is_running_as_root() {
            failures.push(ValidationError::NotRoot);
        }

        if let Some(probe) = &self.network_probe {
            if let Err(reason) = probe_network(probe, NETWORK_TIMEOUT) {
                failures.push(ValidationError::Offline {
                    probe: probe.clone(),
                    reason,
                });
            }
        }

        let missing: Vec<String> = self
            .required_tools
            .iter()
            .filter(|tool| find_in_path(tool).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            failures.push(ValidationError::MissingTools(missing));
        }

        failures
    }

    /// Gate pipeline entry on the environment
    pub fn validate(&self) -> Result<(), InstallError> {
        debug!("Running pre-flight checks: {:?}", self);
        let failures = self.check_all();
        if failures.is_empty() {
            info!("Pre-flight checks passed");
            Ok(())
        } else {
            Err(InstallError::Preflight(failures))
        }
    }
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn probe_network(probe: &str, timeout: Duration) -> Result<(), String> {
    let addrs = probe
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve: {e}"))?;

    let mut last_error = String::from("no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => {
                debug!("Network probe {} reachable via {}", probe, addr);
                return Ok(());
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

/// Locate an executable on PATH
pub fn find_in_path(tool: &str) -> Option<std::path::PathBuf> {
    if tool.contains('/') {
        let path = Path::new(tool);
        return is_executable(path).then(|| path.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Human-readable failure report, one block per unmet condition
pub struct PreflightReport<'a>(pub &'a [ValidationError]);

impl fmt::Display for PreflightReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pre-flight check failed")?;
        writeln!(f)?;
        for failure in self.0 {
            writeln!(f, "  ERROR: {failure}")?;
            match failure {
                ValidationError::NotRoot => {
                    writeln!(f, "    Partitioning and mounting need root. Run with sudo or as root.")?;
                }
                ValidationError::Offline { .. } => {
                    writeln!(f, "    The package base is downloaded during install. Check cabling or Wi-Fi.")?;
                }
                ValidationError::MissingTools(_) => {
                    writeln!(f, "    Install the listed tools on the live system and try again.")?;
                }
            }
        }
        Ok(())
    }
}
