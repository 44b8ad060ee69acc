//! `tallyforge-coordination` - job coordination core.
//!
//! Long-running, per-user recomputation jobs (ledger rebuilds, tax figures,
//! balance snapshots) are re-triggered constantly by unrelated events: new
//! transactions, wallet syncs, imports. This crate makes those jobs
//! exactly-once-in-effect:
//!
//! - At most one invocation of a logical job identity executes at a time
//! - Each logical job's lifecycle is tracked in a durable status record
//! - A running invocation can notice it has been superseded by a fresher
//!   equivalent submission and yield early, without corrupting state
//! - Conflicts between an in-flight job and a new request for the same
//!   identity resolve per a declared policy (reschedule or drop)
//!
//! ## Components
//!
//! - `identity`: kind + key arguments -> stable fingerprint
//! - `lock`: `queued`/`running` reservations in a shared store
//! - `status`: durable lifecycle record per logical job
//! - `guard`: cooperative, rate-limited supersession checks
//! - `orchestrator`: submit / run-now entry points and conflict policy
//! - `stage`: ordered pipeline execution with poll boundaries
//! - `queue` / `worker`: durable transport seam and the pickup loop
//! - `batch`: order-preserving batched loads

pub mod batch;
pub mod clock;
pub mod error;
pub mod guard;
pub mod identity;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod stage;
pub mod status;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use batch::{BatchSource, OrderedBatchFetch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, CoordinationError, Superseded};
pub use guard::{
    CancellationGuard, CancellationToken, ChangeProbe, GuardMode, DEFAULT_GUARD_INTERVAL,
};
pub use identity::{Fingerprint, JobArgs, JobIdentity, JobKind, KeyArgSelector};
pub use lock::{InMemoryLockRegistry, LockError, LockRegistry};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig, RunOutcome, SubmitOutcome};
pub use queue::{InMemoryQueue, QueueError, QueueItem, QueueItemId, QueueTransport};
pub use registry::{ConflictPolicy, JobDefinition, JobRegistry, DEFAULT_RESCHEDULE_DELAY};
pub use stage::{PipelineStep, ProcessingStage, StageContext, StageError, StageRunner};
pub use status::{InMemoryStatusStore, JobState, StatusError, StatusRecord, StatusStore};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
