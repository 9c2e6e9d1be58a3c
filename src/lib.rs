//! stagerun library
//!
//! A resumable, unattended installer driver: a fixed list of named steps run
//! in order, each recorded durably once complete, with the user's answers
//! snapshotted so a restarted run picks up where the last one stopped.

pub mod abort;
pub mod cli;
pub mod completion;
pub mod confirm;
pub mod context;
pub mod error;
pub mod install_config;
pub mod installer;
pub mod pipeline;
pub mod preflight;
pub mod script_runner;
pub mod snapshot;
pub mod types;

// Re-export main types for convenience
pub use abort::{AbortFlag, AbortHandler, ChildRegistry, CleanupLatch, CommandProcessGroup, MountRegistry};
pub use completion::{CompletionError, CompletionLog, CompletionStore, MemoryCompletionStore};
pub use context::PipelineContext;
pub use error::InstallError;
pub use install_config::{ConfigSource, InstallConfig, JsonFileSource, PromptSource, Secrets};
pub use installer::{InstallOptions, STEP_NAMES, run_install};
pub use pipeline::{Pipeline, RunReport, Step, StepState};
pub use preflight::{Preflight, ValidationError};
pub use script_runner::{ScriptOutput, run_step_script};
pub use snapshot::{ConfigSnapshot, SnapshotError, SnapshotStore};
pub use types::{Filesystem, InstallProfile};
