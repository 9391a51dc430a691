//! The build state machine.
//!
//! A [`Machine`] runs the ordered [`StepList`] of one [`Flavor`]:
//!
//! ```text
//! Initializing --setup()--> Validating --run()--> Executing --> Completed
//!                               |                     |
//!                               +------> Aborted <----+
//! ```
//!
//! `setup()` always runs its stages in the same order:
//!
//! 1. [`Flavor::locate_inputs`] - cheap checks that the flavor's inputs exist
//! 2. common option validation (`--until`/`--thru`/`--resume`/`--workdir`)
//! 3. resume metadata read, when `--resume` is given
//! 4. [`Flavor::derive_parameters`] - parsing and derivation of build inputs
//!
//! so invalid bounds are reported before any expensive parsing happens, and
//! nothing is executed or written until `run()`.
//!
//! `run()` executes steps strictly one at a time. After each successful step
//! the step name and a snapshot of [`Auxiliary`] are written to the resume
//! metadata, so an interrupted build continues at the first step that did
//! not finish. A failed step is never retried; a resumed build runs it again
//! from scratch, so steps must tolerate leftovers from an earlier attempt.

pub mod metadata;
pub mod state;

use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::validate;

pub use metadata::ResumeMetadata;
pub use state::{Auxiliary, MachineState, StateField};

pub type StepAction = Box<dyn Fn(&mut MachineState) -> anyhow::Result<()>>;

/// A named build step.
pub struct Step {
    name: &'static str,
    action: StepAction,
    reads: &'static [StateField],
    writes: &'static [StateField],
}

impl Step {
    pub fn new<F>(name: &'static str, action: F) -> Self
    where
        F: Fn(&mut MachineState) -> anyhow::Result<()> + 'static,
    {
        Self {
            name,
            action: Box::new(action),
            reads: &[],
            writes: &[],
        }
    }

    /// State fields that must be set before the step runs.
    pub fn reads(mut self, fields: &'static [StateField]) -> Self {
        self.reads = fields;
        self
    }

    /// State fields the step must have set when it returns.
    pub fn writes(mut self, fields: &'static [StateField]) -> Self {
        self.writes = fields;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// The ordered steps of a machine. Fixed once built.
#[derive(Debug)]
pub struct StepList {
    steps: Vec<Step>,
}

impl StepList {
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        for (index, step) in steps.iter().enumerate() {
            if steps[..index].iter().any(|s| s.name == step.name) {
                return Err(Error::validation(format!(
                    "step '{}' is declared twice",
                    step.name
                )));
            }
        }
        Ok(Self { steps })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }
}

/// Options shared by every image type.
#[derive(Debug, Clone, Default)]
pub struct CommonOptions {
    pub workdir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub until: Option<String>,
    pub thru: Option<String>,
    pub resume: bool,
}

/// An image type: its steps, its inputs, and how it turns them into build
/// parameters.
pub trait Flavor {
    /// Short name recorded in resume metadata, e.g. `snap`.
    fn name(&self) -> &'static str;

    /// Build the step list for this run.
    fn steps(&self, common: &CommonOptions) -> Result<StepList>;

    /// Flavor options as `(name, value)` pairs, for logging.
    fn options(&self) -> Vec<(&'static str, String)>;

    /// Locate the flavor's inputs without parsing them.
    fn locate_inputs(&mut self) -> Result<()>;

    /// Parse and validate the inputs and record derived parameters in
    /// `state`. Runs after resume metadata has been restored.
    fn derive_parameters(&mut self, state: &mut MachineState) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initializing,
    Validating,
    Executing,
    Completed,
    Aborted,
}

pub struct Machine {
    common: CommonOptions,
    flavor: Box<dyn Flavor>,
    steps: StepList,
    state: MachineState,
    metadata: ResumeMetadata,
    status: Status,
}

impl Machine {
    pub fn new(common: CommonOptions, flavor: Box<dyn Flavor>) -> Result<Self> {
        let steps = flavor.steps(&common)?;
        let metadata = ResumeMetadata::new(flavor.name());
        let state = MachineState::new(common.workdir.clone());
        Ok(Self {
            common,
            flavor,
            steps,
            state,
            metadata,
            status: Status::Initializing,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.names()
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.metadata.completed_steps
    }

    /// Validate everything and restore resume state. Runs no step.
    pub fn setup(&mut self) -> Result<()> {
        if self.status != Status::Initializing {
            return Err(Error::validation("machine has already been set up"));
        }
        self.status = Status::Validating;

        let result = self.setup_stages();
        if result.is_err() {
            self.status = Status::Aborted;
        }
        result
    }

    fn setup_stages(&mut self) -> Result<()> {
        log::debug!(
            "setting up {} build with {:?}",
            self.flavor.name(),
            self.flavor.options()
        );

        self.flavor.locate_inputs()?;
        self.validate_common()?;
        if self.common.resume {
            self.read_metadata()?;
        }

        let restored = self.state.aux.clone();
        self.flavor.derive_parameters(&mut self.state)?;
        let conflicts = restored.conflicts_with(&self.state.aux);
        if !conflicts.is_empty() {
            return Err(Error::resume_mismatch(format!(
                "build inputs changed since the interrupted run: {}",
                conflicts.join("; ")
            )));
        }
        Ok(())
    }

    fn validate_common(&self) -> Result<()> {
        let common = &self.common;
        validate::check_conflict(
            ("until", common.until.is_some()),
            ("thru", common.thru.is_some()),
        )?;
        validate::check_requires(("resume", common.resume), ("workdir", common.workdir.is_some()))?;
        validate::check_requires(
            ("until", common.until.is_some()),
            ("workdir", common.workdir.is_some()),
        )?;
        validate::check_requires(
            ("thru", common.thru.is_some()),
            ("workdir", common.workdir.is_some()),
        )?;

        if let Some(until) = &common.until {
            validate::check_step_exists("until", until, self.steps.names())?;
        }
        if let Some(thru) = &common.thru {
            validate::check_step_exists("thru", thru, self.steps.names())?;
        }
        Ok(())
    }

    fn read_metadata(&mut self) -> Result<()> {
        let workdir = self
            .common
            .workdir
            .as_deref()
            .ok_or_else(|| Error::validation("--resume requires --workdir"))?;
        let metadata = metadata::read(workdir)?;
        if let Err(err) = metadata.check_resumable(self.flavor.name(), &self.steps.names()) {
            log::debug!("recorded state: {:?}", metadata::describe(&metadata));
            return Err(err);
        }

        log::info!(
            "resuming after {} completed steps",
            metadata.completed_steps.len()
        );
        self.state.aux = metadata.state.clone();
        self.metadata = metadata;
        Ok(())
    }

    /// Index range `[start, end)` of the steps this run executes.
    pub fn step_range(&self) -> (usize, usize) {
        let start = self.metadata.completed_steps.len();
        let end = if let Some(thru) = &self.common.thru {
            self.steps.index_of(thru).map_or(self.steps.len(), |i| i + 1)
        } else if let Some(until) = &self.common.until {
            self.steps.index_of(until).unwrap_or(self.steps.len())
        } else {
            self.steps.len()
        };
        (start, end)
    }

    /// Run the steps in range, recording progress after each one.
    pub fn run(&mut self) -> Result<()> {
        if self.status != Status::Validating {
            return Err(Error::validation(format!(
                "machine cannot run from state {:?}; call setup() first",
                self.status
            )));
        }
        self.status = Status::Executing;

        let result = self.run_steps();
        self.status = match result {
            Ok(()) => Status::Completed,
            Err(_) => Status::Aborted,
        };
        result
    }

    fn run_steps(&mut self) -> Result<()> {
        let _lock = match &self.common.workdir {
            Some(workdir) => Some(metadata::lock_workdir(workdir)?),
            None => None,
        };

        let (start, end) = self.step_range();
        let total = self.steps.len();
        if start >= end {
            log::info!(
                "nothing to do: {} of {} steps already completed, stopping before step #{}",
                start,
                total,
                end
            );
            return Ok(());
        }

        for index in start..end {
            let step = &self.steps.steps[index];
            log::info!("[{}/{}] {}", index + 1, total, step.name);

            execute_step(step, &mut self.state)?;

            self.metadata.completed_steps.push(step.name.to_string());
            if let Some(workdir) = &self.common.workdir {
                self.metadata.state = self.state.aux.clone();
                metadata::write(workdir, &mut self.metadata)?;
            }
        }

        if end < total {
            log::info!(
                "stopped before '{}' as requested",
                self.steps.steps[end].name
            );
        } else {
            log::info!("all {} steps completed", total);
        }
        Ok(())
    }
}

fn execute_step(step: &Step, state: &mut MachineState) -> Result<()> {
    let fail = |source: anyhow::Error| Error::StepExecution {
        step: step.name.to_string(),
        source,
    };

    if let Some(field) = step.reads.iter().find(|f| !state.aux.is_set(**f)) {
        return Err(fail(anyhow::anyhow!(
            "requires '{}' but no earlier step produced it",
            field
        )));
    }

    (step.action)(state).map_err(fail)?;

    if let Some(field) = step.writes.iter().find(|f| !state.aux.is_set(**f)) {
        return Err(fail(anyhow::anyhow!(
            "finished without producing '{}'",
            field
        )));
    }
    Ok(())
}
