//! Per-kind job registration.
//!
//! Everything that varies between job kinds - conflict policy, key-argument
//! subset, actor position, pipeline, change probe - is declared here in an
//! explicit table resolved at startup. All other coordination logic is
//! shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tallyforge_core::{DomainError, UserId};

use crate::guard::{ChangeProbe, GuardMode};
use crate::identity::{JobArgs, JobIdentity, JobKind, KeyArgSelector};
use crate::stage::{PipelineStep, ProcessingStage};

/// What happens when a submission targets an already-reserved identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Re-enqueue for later execution, trusting the in-flight job to run.
    Reschedule,
    /// Treat as already covered; do nothing.
    Drop,
}

/// Default delay applied when a conflicting work item is rescheduled.
pub const DEFAULT_RESCHEDULE_DELAY: Duration = Duration::from_secs(10);

/// Static registration entry for one job kind.
pub struct JobDefinition {
    kind: JobKind,
    conflict_policy: ConflictPolicy,
    key_args: KeyArgSelector,
    actor_arg: Option<usize>,
    reschedule_delay: Duration,
    pipeline: Vec<PipelineStep>,
    probe: Option<Arc<dyn ChangeProbe>>,
}

impl JobDefinition {
    pub fn new(kind: impl Into<JobKind>) -> Self {
        Self {
            kind: kind.into(),
            conflict_policy: ConflictPolicy::Reschedule,
            key_args: KeyArgSelector::All,
            actor_arg: None,
            reschedule_delay: DEFAULT_RESCHEDULE_DELAY,
            pipeline: Vec::new(),
            probe: None,
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Declare which argument positions participate in the identity.
    pub fn with_key_args(mut self, selector: KeyArgSelector) -> Self {
        self.key_args = selector;
        self
    }

    /// Declare the argument position holding the actor (user) id.
    pub fn with_actor_arg(mut self, position: usize) -> Self {
        self.actor_arg = Some(position);
        self
    }

    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.reschedule_delay = delay;
        self
    }

    /// Append a stage with its guard schedule.
    pub fn with_stage(
        mut self,
        name: impl Into<String>,
        guard: GuardMode,
        stage: Arc<dyn ProcessingStage>,
    ) -> Self {
        self.pipeline.push(PipelineStep::new(name, guard, stage));
        self
    }

    /// Attach the external change probe consulted by `LocksAndProbe` polls.
    pub fn with_probe(mut self, probe: Arc<dyn ChangeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    pub fn reschedule_delay(&self) -> Duration {
        self.reschedule_delay
    }

    pub fn pipeline(&self) -> &[PipelineStep] {
        &self.pipeline
    }

    pub fn probe(&self) -> Option<Arc<dyn ChangeProbe>> {
        self.probe.clone()
    }

    /// Identity of a submission for this kind.
    pub fn identity(&self, args: &JobArgs) -> JobIdentity {
        JobIdentity::new(self.kind.clone(), self.key_args.select(args))
    }

    /// Actor extracted from the declared argument position, if any.
    ///
    /// Jobs without an identifiable actor run without status tracking.
    pub fn actor(&self, args: &JobArgs) -> Option<UserId> {
        let value = args.get(self.actor_arg?)?;
        value.as_str()?.parse().ok()
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("kind", &self.kind)
            .field("conflict_policy", &self.conflict_policy)
            .field("key_args", &self.key_args)
            .field("actor_arg", &self.actor_arg)
            .field("stages", &self.pipeline.len())
            .finish_non_exhaustive()
    }
}

/// Startup-time registration table: kind -> definition.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<JobKind, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind. Registering the same kind twice is a conflict.
    pub fn register(&mut self, definition: JobDefinition) -> Result<(), DomainError> {
        if self.definitions.contains_key(definition.kind()) {
            return Err(DomainError::conflict(format!(
                "job kind already registered: {}",
                definition.kind()
            )));
        }
        self.definitions
            .insert(definition.kind().clone(), definition);
        Ok(())
    }

    pub fn get(&self, kind: &JobKind) -> Option<&JobDefinition> {
        self.definitions.get(kind)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
