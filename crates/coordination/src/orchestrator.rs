//! Job dispatch: submission and pickup for logical jobs.
//!
//! The orchestrator composes the lock registry, status store, and queue
//! transport under the per-kind registration table:
//!
//! ```text
//! submit(kind, args)
//!   ↓
//! 1. fingerprint(kind, key args)
//!   ↓
//! 2. try_reserve_queued            - conflict? apply the kind's policy
//!   ↓
//! 3. enqueue durable work item
//!   ↓
//! 4. open (or reuse) status record
//!
//! run_now(kind, args)              - invoked at pickup by the worker
//!   ↓
//! 1. release queued / take running - conflict? apply the kind's policy
//!   ↓
//! 2. status -> Executing
//!   ↓
//! 3. StageRunner drives the pipeline, polling the guard between stages
//!   ↓
//! 4. release running on every exit path; finalize status
//! ```
//!
//! A `Superseded` exit is silent: the running lock is released and the
//! status record is left exactly as the newer instance will manage it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tallyforge_core::InvocationId;

use crate::clock::Clock;
use crate::error::CoordinationError;
use crate::guard::{CancellationGuard, DEFAULT_GUARD_INTERVAL};
use crate::identity::{Fingerprint, JobArgs, JobKind};
use crate::lock::{LockError, LockRegistry};
use crate::queue::{QueueItem, QueueTransport};
use crate::registry::{ConflictPolicy, JobDefinition, JobRegistry};
use crate::stage::StageRunner;
use crate::status::StatusStore;

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Identity reserved and work item enqueued.
    Accepted,
    /// Identity already reserved; re-enqueued for later execution.
    Rescheduled,
    /// Identity already reserved; treated as covered.
    Deduplicated,
}

/// Outcome of one pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A newer equivalent job superseded this invocation; silent exit.
    Superseded,
    /// Another invocation held the running slot; item re-enqueued.
    Rescheduled,
    /// Another invocation held the running slot; item dropped.
    Dropped,
}

/// Coordination tuning knobs.
///
/// TTLs are liveness safety nets for crashed workers, not correctness
/// guarantees; the guard interval bounds supersession staleness.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queued_ttl: Duration,
    pub running_ttl: Duration,
    pub guard_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queued_ttl: Duration::from_secs(60 * 60),
            running_ttl: Duration::from_secs(4 * 60 * 60),
            guard_interval: DEFAULT_GUARD_INTERVAL,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_queued_ttl(mut self, ttl: Duration) -> Self {
        self.queued_ttl = ttl;
        self
    }

    pub fn with_running_ttl(mut self, ttl: Duration) -> Self {
        self.running_ttl = ttl;
        self
    }

    pub fn with_guard_interval(mut self, interval: Duration) -> Self {
        self.guard_interval = interval;
        self
    }
}

/// Dispatch entry point for logical jobs.
///
/// Generic over the status store and queue transport so tests run against
/// the in-memory implementations and deployments plug in the durable ones.
/// The lock registry is shared with each invocation's cancellation guard.
pub struct JobOrchestrator<S, Q> {
    registry: Arc<JobRegistry>,
    locks: Arc<dyn LockRegistry>,
    status: S,
    queue: Q,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl<S, Q> JobOrchestrator<S, Q>
where
    S: StatusStore,
    Q: QueueTransport,
{
    pub fn new(
        registry: Arc<JobRegistry>,
        locks: Arc<dyn LockRegistry>,
        status: S,
        queue: Q,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            locks,
            status,
            queue,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submit a logical job.
    ///
    /// Reserves the `queued` slot for the identity, enqueues the durable
    /// work item, and opens (or reuses) the status record. A conflicting
    /// submission applies the kind's declared conflict policy instead of
    /// failing.
    pub fn submit(
        &self,
        kind: &JobKind,
        args: JobArgs,
    ) -> Result<SubmitOutcome, CoordinationError> {
        let definition = self.definition(kind)?;
        let fingerprint = definition.identity(&args).fingerprint();

        // Reserve/release are write operations: an unreachable store rejects
        // the submission instead of proceeding unlocked.
        let reserved = self
            .locks
            .try_reserve_queued(&fingerprint, self.config.queued_ttl)?;

        if !reserved {
            return self.resolve_submit_conflict(definition, args, &fingerprint);
        }

        let item = QueueItem::new(kind.clone(), args.clone());
        if let Err(enqueue_err) = self.queue.enqueue(item, None) {
            // Give the reservation back; otherwise the identity is wedged
            // until the TTL expires.
            if let Err(release_err) = self.locks.release_queued(&fingerprint) {
                warn!(
                    fingerprint = %fingerprint,
                    error = %release_err,
                    "failed to release queued reservation after enqueue failure"
                );
            }
            return Err(enqueue_err.into());
        }

        self.open_status(definition, &args, &fingerprint);

        info!(kind = %kind, fingerprint = %fingerprint, "job accepted");
        Ok(SubmitOutcome::Accepted)
    }

    /// Execute a dequeued work item.
    ///
    /// Releases the `queued` reservation, takes the `running` slot, drives
    /// the stage pipeline, and finalizes locks and status on every exit
    /// path. A `Superseded` exit leaves the status record for the newer
    /// instance.
    pub fn run_now(&self, kind: &JobKind, args: JobArgs) -> Result<RunOutcome, CoordinationError> {
        let definition = self.definition(kind)?;
        let fingerprint = definition.identity(&args).fingerprint();

        self.locks.release_queued(&fingerprint)?;

        let running = self
            .locks
            .try_mark_running(&fingerprint, self.config.running_ttl)?;

        if !running {
            return match definition.conflict_policy() {
                ConflictPolicy::Reschedule => {
                    let item = QueueItem::new(kind.clone(), args);
                    self.queue
                        .enqueue(item, Some(definition.reschedule_delay()))?;
                    debug!(kind = %kind, fingerprint = %fingerprint, "identity already executing; rescheduled");
                    Ok(RunOutcome::Rescheduled)
                }
                ConflictPolicy::Drop => {
                    debug!(kind = %kind, fingerprint = %fingerprint, "identity already executing; dropped");
                    Ok(RunOutcome::Dropped)
                }
            };
        }

        let invocation = InvocationId::new();
        let actor = definition.actor(&args);
        if let Some(actor) = actor {
            if let Err(e) = self.status.mark_executing(actor, kind, &fingerprint) {
                warn!(actor = %actor, kind = %kind, error = %e, "failed to mark status executing");
            }
        }

        info!(%invocation, kind = %kind, fingerprint = %fingerprint, "job executing");

        let guard = CancellationGuard::new(
            Arc::clone(&self.locks),
            Arc::clone(&self.clock),
            fingerprint.clone(),
            args.clone(),
            definition.probe(),
            self.config.guard_interval,
        );
        let result = StageRunner::new(guard).run(
            invocation,
            kind,
            actor,
            &args,
            definition.pipeline(),
        );

        // Every exit path drops the running slot; on failure here the TTL
        // eventually clears it.
        if let Err(e) = self.locks.release_running(&fingerprint) {
            warn!(fingerprint = %fingerprint, error = %e, "failed to release running reservation");
        }

        match result {
            Ok(()) => {
                if let Some(actor) = actor {
                    if let Err(e) = self.status.mark_succeeded(actor, kind, &fingerprint) {
                        warn!(actor = %actor, kind = %kind, error = %e, "failed to mark status succeeded");
                    }
                }
                info!(%invocation, kind = %kind, "job completed");
                Ok(RunOutcome::Completed)
            }
            Err(CoordinationError::Superseded) => {
                // The newer instance finalizes the status record.
                debug!(%invocation, kind = %kind, "job superseded; yielding silently");
                Ok(RunOutcome::Superseded)
            }
            Err(err) => {
                if let Some(actor) = actor {
                    if let Err(e) =
                        self.status
                            .mark_failed(actor, kind, &fingerprint, &err.to_string())
                    {
                        warn!(actor = %actor, kind = %kind, error = %e, "failed to mark status failed");
                    }
                }
                warn!(%invocation, kind = %kind, error = %err, "job failed");
                Err(err)
            }
        }
    }

    /// Is this logical job currently pending pickup?
    ///
    /// Lock store read failures degrade to `false` (assume not reserved);
    /// only write operations reject on an unavailable store.
    pub fn is_queued(&self, kind: &JobKind, args: &JobArgs) -> Result<bool, CoordinationError> {
        let fingerprint = self.fingerprint(kind, args)?;
        Ok(read_or_assume_free(
            self.locks.is_queued(&fingerprint),
            &fingerprint,
        ))
    }

    /// Is this logical job currently executing?
    pub fn is_running(&self, kind: &JobKind, args: &JobArgs) -> Result<bool, CoordinationError> {
        let fingerprint = self.fingerprint(kind, args)?;
        Ok(read_or_assume_free(
            self.locks.is_running(&fingerprint),
            &fingerprint,
        ))
    }

    /// Open status record for the submission, if it tracks one.
    pub fn status_of(
        &self,
        kind: &JobKind,
        args: &JobArgs,
    ) -> Result<Option<crate::status::StatusRecord>, CoordinationError> {
        let definition = self.definition(kind)?;
        let Some(actor) = definition.actor(args) else {
            return Ok(None);
        };
        let fingerprint = definition.identity(args).fingerprint();
        Ok(self.status.get_open(actor, kind, &fingerprint)?)
    }

    fn definition(&self, kind: &JobKind) -> Result<&JobDefinition, CoordinationError> {
        self.registry
            .get(kind)
            .ok_or_else(|| CoordinationError::UnknownKind(kind.clone()))
    }

    fn fingerprint(&self, kind: &JobKind, args: &JobArgs) -> Result<Fingerprint, CoordinationError> {
        Ok(self.definition(kind)?.identity(args).fingerprint())
    }

    fn resolve_submit_conflict(
        &self,
        definition: &JobDefinition,
        args: JobArgs,
        fingerprint: &Fingerprint,
    ) -> Result<SubmitOutcome, CoordinationError> {
        match definition.conflict_policy() {
            ConflictPolicy::Reschedule => {
                let item = QueueItem::new(definition.kind().clone(), args);
                self.queue
                    .enqueue(item, Some(definition.reschedule_delay()))?;
                debug!(
                    kind = %definition.kind(),
                    fingerprint = %fingerprint,
                    "identity already reserved; rescheduled"
                );
                Ok(SubmitOutcome::Rescheduled)
            }
            ConflictPolicy::Drop => {
                debug!(
                    kind = %definition.kind(),
                    fingerprint = %fingerprint,
                    "identity already reserved; dropped"
                );
                Ok(SubmitOutcome::Deduplicated)
            }
        }
    }

    fn open_status(&self, definition: &JobDefinition, args: &JobArgs, fingerprint: &Fingerprint) {
        let Some(actor) = definition.actor(args) else {
            return;
        };
        // Status tracking is observability; a failure here must not undo an
        // already-enqueued work item.
        if let Err(e) = self.status.find_or_create(actor, definition.kind(), fingerprint) {
            warn!(
                actor = %actor,
                kind = %definition.kind(),
                error = %e,
                "failed to open status record"
            );
        }
    }
}

fn read_or_assume_free(result: Result<bool, LockError>, fingerprint: &Fingerprint) -> bool {
    match result {
        Ok(reserved) => reserved,
        Err(e) => {
            warn!(fingerprint = %fingerprint, error = %e, "lock store read failed; assuming not reserved");
            false
        }
    }
}
