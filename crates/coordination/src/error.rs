//! Coordination error taxonomy.
//!
//! `Superseded` is a control-flow signal, not a failure: the logical job is
//! still "in progress" through the newer instance, so it never reaches the
//! submitter or the status record. Only stage failures do.

use thiserror::Error;

use crate::identity::JobKind;
use crate::lock::LockError;
use crate::queue::QueueError;
use crate::status::StatusError;

/// Boxed error type for failures raised by external processing stages.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Control-flow signal: a newer equivalent job now owns this identity and
/// the current invocation should abort silently.
///
/// Deliberately its own type so call sites must distinguish it from real
/// failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("superseded by a newer equivalent job")]
pub struct Superseded;

/// Errors surfaced by the coordination core.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The invocation was superseded. Never reported as a failure to the
    /// submitter.
    #[error("superseded by a newer equivalent job")]
    Superseded,

    /// The shared lock store could not be reached. Submissions are rejected;
    /// proceeding without a lock is never the fallback.
    #[error("lock store unavailable: {0}")]
    StoreUnavailable(String),

    /// The durable queue transport rejected an enqueue.
    #[error("queue transport error: {0}")]
    Queue(String),

    /// The status store failed outside of the recoverable duplicate race.
    #[error("status store error: {0}")]
    Status(String),

    /// Submission referenced a job kind with no registration entry.
    #[error("job kind not registered: {0}")]
    UnknownKind(JobKind),

    /// An external processing stage failed. Drives the status record to
    /// `Failed` and is re-raised to the execution backend.
    #[error("stage '{stage}' of job '{kind}' failed: {source}")]
    Stage {
        kind: JobKind,
        stage: String,
        #[source]
        source: BoxError,
    },
}

impl CoordinationError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, CoordinationError::Superseded)
    }
}

impl From<Superseded> for CoordinationError {
    fn from(_: Superseded) -> Self {
        CoordinationError::Superseded
    }
}

impl From<LockError> for CoordinationError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Unavailable(msg) => CoordinationError::StoreUnavailable(msg),
        }
    }
}

impl From<QueueError> for CoordinationError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Unavailable(msg) | QueueError::Malformed(msg) => {
                CoordinationError::Queue(msg)
            }
        }
    }
}

impl From<StatusError> for CoordinationError {
    fn from(value: StatusError) -> Self {
        match value {
            StatusError::Unavailable(msg) => CoordinationError::Status(msg),
        }
    }
}
