//! Per-invocation working set for step actions.
//!
//! Built once from the loaded (or freshly gathered) configuration and handed
//! to every step by reference. Nothing here is persisted directly; values are
//! either part of the snapshot or re-derived from it on every run.

use std::path::{Path, PathBuf};

use crate::install_config::InstallConfig;

/// Default mount point of the target root filesystem
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/stagerun";

/// Working context shared by all steps of one run
#[derive(Debug, Clone)]
pub struct PipelineContext {
    config: InstallConfig,
    mount_root: PathBuf,
    state_dir: PathBuf,
    boot_partition: String,
    root_partition: String,
}

impl PipelineContext {
    pub fn new(config: InstallConfig, mount_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let device = config.device.trim().to_string();
        Self {
            boot_partition: partition_path(&device, 1),
            root_partition: partition_path(&device, 2),
            config,
            mount_root: mount_root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    pub fn device(&self) -> &str {
        self.config.device.trim()
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn boot_partition(&self) -> &str {
        &self.boot_partition
    }

    pub fn root_partition(&self) -> &str {
        &self.root_partition
    }

    /// Environment handed to step scripts
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        let c = &self.config;
        vec![
            ("INSTALL_DEVICE".to_string(), self.device().to_string()),
            ("BOOT_PARTITION".to_string(), self.boot_partition.clone()),
            ("ROOT_PARTITION".to_string(), self.root_partition.clone()),
            ("ROOT_FILESYSTEM".to_string(), c.filesystem.to_string()),
            ("MKFS_TOOL".to_string(), c.filesystem.mkfs_tool().to_string()),
            ("MOUNT_ROOT".to_string(), self.mount_root.display().to_string()),
            ("STATE_DIR".to_string(), self.state_dir.display().to_string()),
            ("INSTALL_PROFILE".to_string(), c.profile.to_string()),
            ("SYSTEM_HOSTNAME".to_string(), c.hostname.trim().to_string()),
            ("SYSTEM_TIMEZONE".to_string(), c.timezone.trim().to_string()),
            ("SYSTEM_LOCALE".to_string(), c.locale.trim().to_string()),
            ("MAIN_USERNAME".to_string(), c.username.trim().to_string()),
            // Passwords go through the environment so they never appear in argv
            ("MAIN_USER_PASSWORD".to_string(), c.user_password.clone()),
            ("ROOT_PASSWORD".to_string(), c.root_password.clone()),
        ]
    }
}

/// Path of partition `n` on `device`.
///
/// Kernel naming inserts a `p` when the disk name ends in a digit
/// (`/dev/nvme0n1p1`, `/dev/mmcblk0p2`, `/dev/loop0p1`).
pub fn partition_path(device: &str, n: u32) -> String {
    if device.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        format!("{device}p{n}")
    } else {
        format!("{device}{n}")
    }
}
