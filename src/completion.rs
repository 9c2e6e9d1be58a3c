//! Durable completion state
//!
//! Completion is a one-way latch per step name. The file backend keeps an
//! append-only text log with one `name=true` assertion per line; a missing
//! log means nothing has completed yet.
//!
//! The runner only talks to the `CompletionStore` trait, so the text log can
//! be swapped for another backend (the in-memory store is used for dry runs
//! and tests).

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the completion log inside the state directory
pub const COMPLETION_LOG_FILE: &str = "completed.log";

/// File name of the pipeline tag inside the state directory
pub const PIPELINE_TAG_FILE: &str = "pipeline.tag";

const DONE_SUFFIX: &str = "=true";

/// Errors raised by completion stores
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("I/O error on completion state: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid step name {0:?} (must be non-empty, single-line, without '=')")]
    InvalidName(String),
}

/// Log-structured store of completed step names.
pub trait CompletionStore {
    /// Durably record that `name` completed. Must survive a crash right after return.
    fn append(&mut self, name: &str) -> Result<(), CompletionError>;

    /// Return the subset of `names` that have a completion record.
    fn contains_any(&self, names: &[&str]) -> Result<HashSet<String>, CompletionError>;

    /// All recorded names in log order, duplicates removed.
    fn recorded(&self) -> Result<Vec<String>, CompletionError>;

    /// Tag of the step list that produced the recorded progress, if any.
    fn pipeline_tag(&self) -> Result<Option<String>, CompletionError>;

    /// Store the tag of the step list about to run.
    fn set_pipeline_tag(&mut self, tag: &str) -> Result<(), CompletionError>;

    fn is_done(&self, name: &str) -> Result<bool, CompletionError> {
        Ok(self.contains_any(&[name])?.contains(name))
    }

    /// Append a record for `name` unless one already exists.
    fn mark_done(&mut self, name: &str) -> Result<(), CompletionError> {
        if self.is_done(name)? {
            debug!("Step {} already recorded as done", name);
            return Ok(());
        }
        self.append(name)
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), CompletionError> {
    if name.is_empty() || name.contains(['\n', '\r', '=']) {
        return Err(CompletionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Append-only completion log on disk.
#[derive(Debug, Clone)]
pub struct CompletionLog {
    log_path: PathBuf,
    tag_path: PathBuf,
}

impl CompletionLog {
    /// Open (without creating) the completion state stored under `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        Self {
            log_path: dir.join(COMPLETION_LOG_FILE),
            tag_path: dir.join(PIPELINE_TAG_FILE),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn tag_path(&self) -> &Path {
        &self.tag_path
    }

    /// Delete the log and the pipeline tag, forcing a full re-run.
    pub fn reset(&self) -> Result<(), CompletionError> {
        for path in [&self.log_path, &self.tag_path] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_names(&self) -> Result<Vec<String>, CompletionError> {
        let file = match File::open(&self.log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match line.strip_suffix(DONE_SUFFIX) {
                Some(name) if !name.is_empty() && !name.contains('=') => {
                    names.push(name.to_string());
                }
                _ if line.trim().is_empty() => {}
                // A torn final line from a crash mid-append lands here
                _ => warn!("Ignoring malformed completion record {:?}", line),
            }
        }
        Ok(names)
    }
}

impl CompletionStore for CompletionLog {
    fn append(&mut self, name: &str) -> Result<(), CompletionError> {
        validate_name(name)?;

        let created = !self.log_path.exists();
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Terminate a torn final line so the new record stays on its own line
        let torn = !created && ends_without_newline(&self.log_path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let record = format!("{}{name}{DONE_SUFFIX}\n", if torn { "\n" } else { "" });
        file.write_all(record.as_bytes())?;
        file.sync_all()?;

        if created {
            sync_parent_dir(&self.log_path)?;
        }

        debug!("Recorded completion of {}", name);
        Ok(())
    }

    fn contains_any(&self, names: &[&str]) -> Result<HashSet<String>, CompletionError> {
        let wanted: HashSet<&str> = names.iter().copied().collect();
        Ok(self
            .read_names()?
            .into_iter()
            .filter(|n| wanted.contains(n.as_str()))
            .collect())
    }

    fn recorded(&self) -> Result<Vec<String>, CompletionError> {
        let mut seen = HashSet::new();
        Ok(self
            .read_names()?
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .collect())
    }

    fn pipeline_tag(&self) -> Result<Option<String>, CompletionError> {
        match fs::read_to_string(&self.tag_path) {
            Ok(content) => {
                let tag = content.trim();
                Ok((!tag.is_empty()).then(|| tag.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_pipeline_tag(&mut self, tag: &str) -> Result<(), CompletionError> {
        if let Some(parent) = self.tag_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.tag_path.with_extension("tmp");
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(tag.as_bytes())?;
        tmp_file.write_all(b"\n")?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &self.tag_path)?;
        sync_parent_dir(&self.tag_path)?;
        Ok(())
    }
}

fn ends_without_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Flush the directory entry so a freshly created or renamed file survives power loss.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

/// Volatile completion store.
///
/// Used for `--dry-run` (seeded from the real log so the preview matches a
/// resume) and as a test double.
#[derive(Debug, Clone, Default)]
pub struct MemoryCompletionStore {
    names: Vec<String>,
    tag: Option<String>,
}

impl MemoryCompletionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given names already recorded.
    pub fn with_done<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            tag: None,
        }
    }

    /// Copy the current contents of another store.
    pub fn seeded_from(other: &dyn CompletionStore) -> Result<Self, CompletionError> {
        Ok(Self {
            names: other.recorded()?,
            tag: other.pipeline_tag()?,
        })
    }

    /// Raw record list, including duplicates.
    pub fn records(&self) -> &[String] {
        &self.names
    }
}

impl CompletionStore for MemoryCompletionStore {
    fn append(&mut self, name: &str) -> Result<(), CompletionError> {
        validate_name(name)?;
        self.names.push(name.to_string());
        Ok(())
    }

    fn contains_any(&self, names: &[&str]) -> Result<HashSet<String>, CompletionError> {
        Ok(names
            .iter()
            .filter(|n| self.names.iter().any(|r| r == *n))
            .map(|n| n.to_string())
            .collect())
    }

    fn recorded(&self) -> Result<Vec<String>, CompletionError> {
        let mut seen = HashSet::new();
        Ok(self
            .names
            .iter()
            .filter(|n| seen.insert(n.as_str()))
            .cloned()
            .collect())
    }

    fn pipeline_tag(&self) -> Result<Option<String>, CompletionError> {
        Ok(self.tag.clone())
    }

    fn set_pipeline_tag(&mut self, tag: &str) -> Result<(), CompletionError> {
        self.tag = Some(tag.to_string());
        Ok(())
    }
}
