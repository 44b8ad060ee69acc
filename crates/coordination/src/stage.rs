//! Stage pipeline execution for one job invocation.
//!
//! A job invocation runs an ordered list of external processing stages
//! (ledger rebuild, balance match, tax aggregation, snapshot generation, ...)
//! strictly sequentially, consulting the cancellation guard at each declared
//! boundary. Stage boundaries are the only points where an invocation may
//! abort early.

use std::sync::Arc;

use tracing::debug;

use tallyforge_core::{InvocationId, UserId};

use crate::error::{BoxError, CoordinationError, Superseded};
use crate::guard::{CancellationGuard, CancellationToken, GuardMode};
use crate::identity::{JobArgs, JobKind};

/// Failure channel for external processing stages.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Raised by a guard poll inside the stage; the pipeline exits silently.
    #[error("superseded by a newer equivalent job")]
    Superseded,

    /// The stage's own domain failure.
    #[error("{0}")]
    Failed(#[source] BoxError),
}

impl StageError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        StageError::Failed(err.into())
    }
}

impl From<Superseded> for StageError {
    fn from(_: Superseded) -> Self {
        StageError::Superseded
    }
}

impl From<BoxError> for StageError {
    fn from(value: BoxError) -> Self {
        StageError::Failed(value)
    }
}

/// One external processing step.
///
/// Implementations must be safe to abandon at the next poll boundary:
/// idempotent or side-effect-free up to that point.
pub trait ProcessingStage: Send + Sync {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError>;
}

/// Context threaded through each stage of one invocation.
pub struct StageContext<'a> {
    pub invocation: InvocationId,
    pub kind: &'a JobKind,
    pub actor: Option<UserId>,
    pub args: &'a JobArgs,
    guard: &'a CancellationGuard,
    token: &'a mut CancellationToken,
}

impl StageContext<'_> {
    /// Cooperative cancellation check; free inside the guard interval.
    /// Long-running stages should call this periodically.
    pub fn poll(&mut self, mode: GuardMode) -> Result<(), Superseded> {
        self.guard.poll(self.token, mode)
    }
}

/// A named stage plus its guard schedule within a pipeline.
#[derive(Clone)]
pub struct PipelineStep {
    pub name: String,
    pub guard: GuardMode,
    pub stage: Arc<dyn ProcessingStage>,
}

impl PipelineStep {
    pub fn new(
        name: impl Into<String>,
        guard: GuardMode,
        stage: Arc<dyn ProcessingStage>,
    ) -> Self {
        Self {
            name: name.into(),
            guard,
            stage,
        }
    }
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStep")
            .field("name", &self.name)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Executes the ordered stage pipeline for a single invocation.
///
/// Owns the [`CancellationToken`] for the duration of the invocation and
/// discards it on return.
pub struct StageRunner {
    guard: CancellationGuard,
    token: CancellationToken,
}

impl StageRunner {
    pub fn new(guard: CancellationGuard) -> Self {
        Self {
            guard,
            token: CancellationToken::new(),
        }
    }

    /// Run every step in order, polling the guard before each step per its
    /// declared mode. `Superseded` is a clean silent exit; a stage's own
    /// failure is wrapped with job context and re-raised.
    pub fn run(
        mut self,
        invocation: InvocationId,
        kind: &JobKind,
        actor: Option<UserId>,
        args: &JobArgs,
        pipeline: &[PipelineStep],
    ) -> Result<(), CoordinationError> {
        for step in pipeline {
            self.guard.poll(&mut self.token, step.guard)?;

            debug!(%invocation, kind = %kind, stage = %step.name, "running stage");

            let mut ctx = StageContext {
                invocation,
                kind,
                actor,
                args,
                guard: &self.guard,
                token: &mut self.token,
            };

            match step.stage.run(&mut ctx) {
                Ok(()) => {}
                Err(StageError::Superseded) => return Err(CoordinationError::Superseded),
                Err(StageError::Failed(source)) => {
                    return Err(CoordinationError::Stage {
                        kind: kind.clone(),
                        stage: step.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }
}
