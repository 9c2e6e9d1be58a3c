use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::context::DEFAULT_MOUNT_ROOT;

/// stagerun - resumable, unattended OS installer driver
#[derive(Parser, Debug)]
#[command(name = "stagerun")]
#[command(about = "Run the first install stage as a resumable list of steps")]
#[command(version)]
pub struct Cli {
    /// Directory holding the completion log and configuration snapshot
    #[arg(long, global = true, env = "STAGERUN_STATE_DIR", default_value = "/var/lib/stagerun")]
    pub state_dir: PathBuf,

    /// Directory holding `<step>.sh` scripts and `handoff.sh`
    #[arg(
        long,
        global = true,
        env = "STAGERUN_SCRIPTS_DIR",
        default_value = "/usr/share/stagerun/scripts"
    )]
    pub scripts_dir: PathBuf,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Steps and the handoff are logged instead of executed, and neither the
    /// configuration snapshot nor any completion record is written. Existing
    /// records are honoured so the preview matches a real resume.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run or resume the install (default)
    Install {
        /// Read configuration from a JSON file instead of prompting
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Skip the destructive-operation confirmation
        #[arg(short = 'y', long)]
        yes: bool,

        /// Do not write passwords to the configuration snapshot
        #[arg(long)]
        no_persist_secrets: bool,

        /// Stop after the handoff script and unmount instead of rebooting
        #[arg(long)]
        no_reboot: bool,

        /// Mount point of the target root filesystem
        #[arg(long, env = "STAGERUN_MOUNT_ROOT", default_value = DEFAULT_MOUNT_ROOT)]
        mount_root: PathBuf,
    },
    /// Show recorded progress and whether a configuration is saved
    Status,
    /// Run the pre-flight checks only
    Preflight,
    /// Forget recorded progress so the next install starts over
    Reset {
        /// Also delete the saved configuration
        #[arg(long)]
        all: bool,
    },
    /// List the step names in execution order
    Steps,
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Commands {
    /// `install` as run with no subcommand
    pub fn default_install() -> Self {
        Self::Install {
            config: None,
            yes: false,
            no_persist_secrets: false,
            no_reboot: false,
            mount_root: std::env::var_os("STAGERUN_MOUNT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_ROOT)),
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
