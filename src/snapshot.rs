//! Configuration snapshot persistence
//!
//! The snapshot is a flat set of `KEY='value'` assignments, one per key,
//! single-quoted so values may hold any character. An embedded quote is
//! written shell-style as `'\''`, which also keeps the file `source`-able
//! by the step scripts.
//!
//! Saves are atomic: the file is written to a sibling temp file, synced,
//! then renamed over the previous snapshot. A reader therefore sees either
//! the old snapshot or the new one, never a partial write.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::completion::sync_parent_dir;

/// File name of the snapshot inside the state directory
pub const SNAPSHOT_FILE: &str = "config.snapshot";

/// Owner read/write only; the snapshot may hold password material
const SNAPSHOT_MODE: u32 = 0o600;

/// Errors raised by the snapshot store
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error on configuration snapshot: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid snapshot key {0:?} (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidKey(String),

    #[error("Corrupt configuration snapshot at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Validated user parameters, keyed by upper-case shell-style names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    values: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this snapshot without the given keys.
    pub fn without(&self, keys: &[&str]) -> Self {
        let mut copy = self.clone();
        for key in keys {
            copy.values.remove(*key);
        }
        copy
    }

    /// Render as `KEY='value'` lines.
    pub fn to_file_format(&self) -> Result<String, SnapshotError> {
        let mut out = String::new();
        for (key, value) in &self.values {
            if !is_valid_key(key) {
                return Err(SnapshotError::InvalidKey(key.clone()));
            }
            out.push_str(key);
            out.push('=');
            out.push_str(&quote(value));
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse `KEY='value'` lines. Blank lines and `#` comments are skipped.
    pub fn parse(input: &str) -> Result<Self, SnapshotError> {
        let mut parser = Parser {
            chars: input.chars().peekable(),
            line: 1,
        };
        let mut snapshot = Self::new();
        while let Some((key, value)) = parser.next_assignment()? {
            snapshot.values.insert(key, value);
        }
        Ok(snapshot)
    }
}

impl FromIterator<(String, String)> for ConfigSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Single-quote a value, closing and reopening the quote around each `'`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> SnapshotError {
        SnapshotError::Parse {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn skip_blank_and_comments(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn next_assignment(&mut self) -> Result<Option<(String, String)>, SnapshotError> {
        self.skip_blank_and_comments();
        if self.chars.peek().is_none() {
            return Ok(None);
        }

        let mut key = String::new();
        loop {
            match self.chars.peek().copied() {
                Some('=') => {
                    self.bump();
                    break;
                }
                Some('\n') | None => return Err(self.error("missing '=' after key")),
                Some(c) => {
                    self.bump();
                    key.push(c);
                }
            }
        }
        if !is_valid_key(&key) {
            return Err(self.error(format!("invalid key {key:?}")));
        }

        // A value is a run of 'quoted' segments and \' escapes up to end of line
        let mut value = String::new();
        loop {
            match self.chars.peek().copied() {
                None | Some('\n') => break,
                Some('\'') => {
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('\'') => break,
                            Some(c) => value.push(c),
                            None => return Err(self.error("unterminated quoted value")),
                        }
                    }
                }
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some('\'') => value.push('\''),
                        _ => return Err(self.error("only \\' escapes are allowed outside quotes")),
                    }
                }
                Some(c) => {
                    return Err(self.error(format!("unexpected {c:?} outside quotes")));
                }
            }
        }

        Ok(Some((key, value)))
    }
}

/// Atomic, owner-only snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Snapshot stored under `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(SNAPSHOT_FILE),
        }
    }

    /// Snapshot stored at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Replace the stored snapshot atomically.
    pub fn save(&self, snapshot: &ConfigSnapshot) -> Result<(), SnapshotError> {
        let content = snapshot.to_file_format()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SNAPSHOT_MODE)
            .open(&tmp_path)?;
        // A stale temp file from an earlier crash keeps its old mode
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(SNAPSHOT_MODE))?;
        tmp_file.write_all(content.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        info!("Saved configuration snapshot ({} keys) to {:?}", snapshot.len(), self.path);
        Ok(())
    }

    /// Load the stored snapshot, or `None` if nothing was ever saved.
    pub fn load(&self) -> Result<Option<ConfigSnapshot>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No configuration snapshot at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        ConfigSnapshot::parse(&content).map(Some)
    }

    /// Delete the stored snapshot (no-op if absent).
    pub fn remove(&self) -> Result<(), SnapshotError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
