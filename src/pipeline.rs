//! Linear, resumable step pipeline.
//!
//! Steps run strictly in declaration order. Before a step runs, the
//! completion store is consulted; a recorded step is skipped without side
//! effects. A step that returns success is recorded before the next one
//! starts. A failure stops the run without writing any record for it.
//!
//! # Step Flow
//!
//! ```text
//! Pending ──(all earlier Completed, not recorded)──▶ Running
//! Running ──(action Ok, mark_done)──────────────────▶ Completed
//! Running ──(action Err | abort requested)──────────▶ Failed
//! ```
//!
//! Recording is not atomic with the action: a crash between the two re-runs
//! the action on resume, so actions must be safe to repeat.

use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::abort::AbortFlag;
use crate::completion::{CompletionStore, validate_name};
use crate::error::{InstallError, Result};

/// Step name reported when an interrupt lands before the handoff
pub const HANDOFF_STEP: &str = "handoff";

/// Bump when the meaning of existing steps changes without a rename
pub const PIPELINE_VERSION: u32 = 1;

/// Outcome of one step action
pub type ActionResult = anyhow::Result<()>;

type Action<C> = Box<dyn FnMut(&mut C) -> ActionResult>;
type Handoff<C> = Box<dyn FnOnce(&mut C) -> ActionResult>;

/// Per-step state within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A named, guarded unit of work
pub struct Step<C> {
    name: String,
    action: Action<C>,
}

impl<C> Step<C> {
    pub fn new(name: impl Into<String>, action: impl FnMut(&mut C) -> ActionResult + 'static) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish_non_exhaustive()
    }
}

/// What a completed run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps already recorded by an earlier run
    pub skipped: Vec<String>,
    /// Steps executed and recorded by this run
    pub executed: Vec<String>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} step(s) executed, {} already complete",
            self.executed.len(),
            self.skipped.len()
        )
    }
}

/// Ordered step list with a terminal handoff
pub struct Pipeline<C> {
    steps: Vec<Step<C>>,
    states: Vec<StepState>,
    handoff: Option<Handoff<C>>,
    abort: AbortFlag,
}

impl<C> Pipeline<C> {
    /// Build a pipeline. Step names must be unique and recordable, and may
    /// not contain the tag separator.
    pub fn new(steps: Vec<Step<C>>, abort: AbortFlag) -> Result<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            if validate_name(&step.name).is_err() || step.name.contains(',') {
                return Err(InstallError::config(format!(
                    "Invalid step name {:?}: must be non-empty without '=', ',' or line breaks",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(InstallError::config(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
        }
        Ok(Self {
            states: vec![StepState::Pending; steps.len()],
            steps,
            handoff: None,
            abort,
        })
    }

    /// Action to run once after every step is complete
    pub fn with_handoff(mut self, handoff: impl FnOnce(&mut C) -> ActionResult + 'static) -> Self {
        self.handoff = Some(Box::new(handoff));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// State of `name` within the current run
    pub fn state(&self, name: &str) -> Option<StepState> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(|i| self.states[i])
    }

    /// Identifies this exact step list, stored beside the completion log
    pub fn tag(&self) -> String {
        pipeline_tag(&self.step_names())
    }

    /// Refuse to resume progress recorded for a different step list.
    fn check_tag(&self, store: &mut dyn CompletionStore) -> Result<()> {
        let current = self.tag();
        match store.pipeline_tag()? {
            Some(stored) if stored == current => Ok(()),
            Some(stored) => Err(InstallError::PipelineMismatch { stored, current }),
            None => {
                if !store.recorded()?.is_empty() {
                    warn!("Completion log has no pipeline tag; adopting '{}'", current);
                }
                store.set_pipeline_tag(&current)?;
                Ok(())
            }
        }
    }

    /// Run every pending step in order, then the handoff.
    ///
    /// Returns after the handoff returns. In production the handoff reboots,
    /// so this only returns on error or in tests and `--no-reboot` runs.
    pub fn run(&mut self, store: &mut dyn CompletionStore, ctx: &mut C) -> Result<RunReport> {
        self.check_tag(store)?;

        let done = store.contains_any(&self.step_names())?;
        let total = self.steps.len();
        let mut report = RunReport::default();

        for (i, step) in self.steps.iter_mut().enumerate() {
            if self.abort.is_requested() {
                return Err(InstallError::Interrupted {
                    step: step.name.clone(),
                });
            }

            if done.contains(&step.name) {
                debug!("Skipping {} (already complete)", step.name);
                self.states[i] = StepState::Completed;
                report.skipped.push(step.name.clone());
                continue;
            }

            info!("Running step {} ({}/{})", step.name, i + 1, total);
            self.states[i] = StepState::Running;

            if let Err(e) = (step.action)(ctx) {
                self.states[i] = StepState::Failed;
                if self.abort.is_requested() {
                    return Err(InstallError::Interrupted {
                        step: step.name.clone(),
                    });
                }
                return Err(InstallError::step(step.name.clone(), e));
            }

            // Work finished after cleanup began is abandoned, never recorded
            if self.abort.is_requested() {
                self.states[i] = StepState::Failed;
                return Err(InstallError::Interrupted {
                    step: step.name.clone(),
                });
            }

            store.mark_done(&step.name)?;
            self.states[i] = StepState::Completed;
            info!("Step {} complete", step.name);
            report.executed.push(step.name.clone());
        }

        info!("All steps complete: {}", report);

        if let Some(handoff) = self.handoff.take() {
            if self.abort.is_requested() {
                return Err(InstallError::Interrupted {
                    step: HANDOFF_STEP.to_string(),
                });
            }
            info!("Starting handoff");
            handoff(ctx).map_err(InstallError::Handoff)?;
        }

        Ok(report)
    }
}

/// Tag for an ordered list of step names
pub fn pipeline_tag(names: &[&str]) -> String {
    format!("{}:{}", PIPELINE_VERSION, names.join(","))
}
