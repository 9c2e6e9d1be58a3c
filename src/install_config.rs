//! User installation configuration.
//!
//! `InstallConfig` is the typed form of what the user asks for. It is
//! collected once (from a JSON file or interactive prompts), validated, and
//! flattened into a `ConfigSnapshot` so a resumed run never asks again.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::confirm::confirm_destructive;
use crate::error::InstallError;
use crate::snapshot::ConfigSnapshot;
use crate::types::{Filesystem, InstallProfile};

pub const KEY_DEVICE: &str = "DEVICE";
pub const KEY_HOSTNAME: &str = "HOSTNAME";
pub const KEY_USERNAME: &str = "USERNAME";
pub const KEY_USER_PASSWORD: &str = "USER_PASSWORD";
pub const KEY_ROOT_PASSWORD: &str = "ROOT_PASSWORD";
pub const KEY_TIMEZONE: &str = "TIMEZONE";
pub const KEY_LOCALE: &str = "LOCALE";
pub const KEY_PROFILE: &str = "PROFILE";
pub const KEY_FILESYSTEM: &str = "FILESYSTEM";

/// Snapshot keys holding password material
pub const SECRET_KEYS: &[&str] = &[KEY_USER_PASSWORD, KEY_ROOT_PASSWORD];

/// Every key a complete snapshot carries
pub const ALL_KEYS: &[&str] = &[
    KEY_DEVICE,
    KEY_HOSTNAME,
    KEY_USERNAME,
    KEY_USER_PASSWORD,
    KEY_ROOT_PASSWORD,
    KEY_TIMEZONE,
    KEY_LOCALE,
    KEY_PROFILE,
    KEY_FILESYSTEM,
];

/// Installation configuration supplied by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Whole-disk target, e.g. `/dev/sda` or `/dev/nvme0n1`
    pub device: String,
    pub hostname: String,
    pub username: String,
    pub user_password: String,
    pub root_password: String,
    /// Olson name such as `Europe/Berlin`, or `UTC`
    pub timezone: String,
    pub locale: String,
    pub profile: InstallProfile,
    pub filesystem: Filesystem,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            hostname: String::new(),
            username: String::new(),
            user_password: String::new(),
            root_password: String::new(),
            timezone: "UTC".to_string(),
            locale: "en_US.UTF-8".to_string(),
            profile: InstallProfile::default(),
            filesystem: Filesystem::default(),
        }
    }
}

impl InstallConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse configuration JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let device = self.device.trim();
        if device.is_empty() {
            bail!("Target device must be specified");
        }
        if !device.starts_with("/dev/") || device.len() <= "/dev/".len() {
            bail!("Target device must be a device path such as /dev/sda");
        }

        // RFC 1123 label: 1-63 chars, alphanumeric and '-', no leading/trailing '-'
        let hostname = self.hostname.trim();
        if hostname.is_empty() || hostname.len() > 63 {
            bail!("Hostname must be 1-63 characters long");
        }
        if hostname.starts_with('-') || hostname.ends_with('-') {
            bail!("Hostname cannot start or end with '-'");
        }
        if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            bail!("Hostname can only contain letters, numbers, and '-'");
        }

        let username = self.username.trim();
        if username.is_empty() || username.len() > 32 {
            bail!("Username must be 1-32 characters long");
        }
        if let Some(first_char) = username.chars().next() {
            if !(first_char.is_ascii_lowercase() || first_char == '_') {
                bail!("Username must start with a lowercase letter or '_'");
            }
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            bail!("Username can only contain lowercase letters, digits, '_' and '-'");
        }
        if username == "root" {
            bail!("Username cannot be 'root'");
        }

        if self.user_password.is_empty() {
            bail!("User password must be specified");
        }
        if self.root_password.is_empty() {
            bail!("Root password must be specified");
        }

        let timezone = self.timezone.trim();
        if timezone.is_empty() {
            bail!("Timezone must be specified");
        }
        if timezone.starts_with('/') || timezone.split('/').any(|part| part == ".." || part.is_empty())
        {
            bail!("Timezone must be a zone name such as Europe/Berlin");
        }

        if self.locale.trim().is_empty() || self.locale.contains(char::is_whitespace) {
            bail!("Locale must be a single token such as en_US.UTF-8");
        }

        Ok(())
    }

    /// Flatten into snapshot form
    pub fn to_snapshot(&self) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot::new();
        snapshot.set(KEY_DEVICE, self.device.trim());
        snapshot.set(KEY_HOSTNAME, self.hostname.trim());
        snapshot.set(KEY_USERNAME, self.username.trim());
        snapshot.set(KEY_USER_PASSWORD, self.user_password.as_str());
        snapshot.set(KEY_ROOT_PASSWORD, self.root_password.as_str());
        snapshot.set(KEY_TIMEZONE, self.timezone.trim());
        snapshot.set(KEY_LOCALE, self.locale.trim());
        snapshot.set(KEY_PROFILE, self.profile.to_string());
        snapshot.set(KEY_FILESYSTEM, self.filesystem.to_string());
        snapshot
    }

    /// Rebuild from a stored snapshot. Every key must be present.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self> {
        let missing = missing_keys(snapshot);
        if !missing.is_empty() {
            bail!("Snapshot is missing {}", missing.join(", "));
        }

        let get = |key: &str| snapshot.get(key).unwrap_or_default().to_string();
        Ok(Self {
            device: get(KEY_DEVICE),
            hostname: get(KEY_HOSTNAME),
            username: get(KEY_USERNAME),
            user_password: get(KEY_USER_PASSWORD),
            root_password: get(KEY_ROOT_PASSWORD),
            timezone: get(KEY_TIMEZONE),
            locale: get(KEY_LOCALE),
            profile: InstallProfile::from_str(&get(KEY_PROFILE))
                .with_context(|| format!("Unknown profile {:?}", get(KEY_PROFILE)))?,
            filesystem: Filesystem::from_str(&get(KEY_FILESYSTEM))
                .with_context(|| format!("Unknown filesystem {:?}", get(KEY_FILESYSTEM)))?,
        })
    }
}

/// Keys from `ALL_KEYS` absent in `snapshot`
pub fn missing_keys(snapshot: &ConfigSnapshot) -> Vec<&'static str> {
    ALL_KEYS
        .iter()
        .copied()
        .filter(|key| !snapshot.contains_key(key))
        .collect()
}

/// Password material collected separately when it was not persisted
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    pub user_password: String,
    pub root_password: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets { .. }")
    }
}

impl Secrets {
    /// Fill the secret keys of a snapshot
    pub fn apply_to(&self, snapshot: &mut ConfigSnapshot) {
        snapshot.set(KEY_USER_PASSWORD, self.user_password.as_str());
        snapshot.set(KEY_ROOT_PASSWORD, self.root_password.as_str());
    }
}

/// Where configuration comes from on a first run.
///
/// The source also owns the operator's input, so the destructive-action
/// confirmation reads from the same place the answers came from.
pub trait ConfigSource {
    /// Collect a full configuration
    fn gather(&mut self) -> Result<InstallConfig>;

    /// Collect only password material (resume without persisted secrets)
    fn gather_secrets(&mut self) -> Result<Secrets> {
        let config = self.gather()?;
        Ok(Secrets {
            user_password: config.user_password,
            root_password: config.root_password,
        })
    }

    /// Ask the operator to approve wiping `device` (stdin/stderr by default)
    fn confirm(&mut self, device: &str) -> std::result::Result<(), InstallError> {
        confirm_destructive(device, std::io::stdin().lock(), std::io::stderr())
    }
}

/// Non-interactive source backed by a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for JsonFileSource {
    fn gather(&mut self) -> Result<InstallConfig> {
        InstallConfig::load_from_file(&self.path)
    }
}

/// Line-based prompts on a reader/writer pair (stdin/stderr in production)
pub struct PromptSource<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptSource<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, label: &str, default: Option<&str>) -> Result<String> {
        match default {
            Some(d) if !d.is_empty() => write!(self.output, "{label} [{d}]: ")?,
            _ => write!(self.output, "{label}: ")?,
        }
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            bail!("Input closed while asking for {label}");
        }
        let answer = line.trim_end_matches(['\n', '\r']).to_string();
        if answer.is_empty() {
            Ok(default.unwrap_or_default().to_string())
        } else {
            Ok(answer)
        }
    }

    fn ask_password(&mut self, label: &str) -> Result<String> {
        loop {
            let first = self.ask(label, None)?;
            if first.is_empty() {
                writeln!(self.output, "Password cannot be empty.")?;
                continue;
            }
            let second = self.ask(&format!("{label} (again)"), None)?;
            if first == second {
                return Ok(first);
            }
            writeln!(self.output, "Passwords do not match, try again.")?;
        }
    }

    fn ask_parsed<T>(&mut self, label: &str, default: T) -> Result<T>
    where
        T: FromStr + ToString,
    {
        loop {
            let answer = self.ask(label, Some(&default.to_string()))?;
            match answer.parse() {
                Ok(value) => return Ok(value),
                Err(_) => writeln!(self.output, "Unrecognised value {answer:?}.")?,
            }
        }
    }
}

impl<R: BufRead, W: Write> ConfigSource for PromptSource<R, W> {
    fn gather(&mut self) -> Result<InstallConfig> {
        let defaults = InstallConfig::default();
        let config = InstallConfig {
            device: self.ask("Target device (e.g. /dev/sda)", None)?,
            hostname: self.ask("Hostname", None)?,
            username: self.ask("Username", None)?,
            user_password: self.ask_password("User password")?,
            root_password: self.ask_password("Root password")?,
            timezone: self.ask("Timezone", Some(&defaults.timezone))?,
            locale: self.ask("Locale", Some(&defaults.locale))?,
            profile: self.ask_parsed("Profile (minimal/desktop/server)", defaults.profile)?,
            filesystem: self.ask_parsed("Root filesystem (ext4/xfs/btrfs/f2fs)", defaults.filesystem)?,
        };
        Ok(config)
    }

    fn gather_secrets(&mut self) -> Result<Secrets> {
        writeln!(
            self.output,
            "Passwords were not saved with the configuration; please enter them again."
        )?;
        Ok(Secrets {
            user_password: self.ask_password("User password")?,
            root_password: self.ask_password("Root password")?,
        })
    }

    fn confirm(&mut self, device: &str) -> std::result::Result<(), InstallError> {
        confirm_destructive(device, &mut self.input, &mut self.output)
    }
}
