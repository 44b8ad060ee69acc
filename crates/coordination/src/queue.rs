//! Durable queue transport boundary.
//!
//! The coordination core only enqueues work items and receives them back at
//! pickup; retry-on-failure and dead-lettering belong to the transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::identity::{JobArgs, JobKind};

/// Identifier assigned by the transport to an enqueued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(pub Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One durable work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub kind: JobKind,
    pub args: JobArgs,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(kind: JobKind, args: JobArgs) -> Self {
        Self {
            id: QueueItemId::new(),
            kind,
            args,
            enqueued_at: Utc::now(),
        }
    }
}

/// Queue transport failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport unavailable: {0}")]
    Unavailable(String),

    /// A dequeued payload could not be decoded into a work item.
    #[error("malformed work item: {0}")]
    Malformed(String),
}

/// Durable queue boundary used by the orchestrator and the worker.
pub trait QueueTransport: Send + Sync {
    /// Append a work item, optionally delayed.
    fn enqueue(&self, item: QueueItem, delay: Option<Duration>) -> Result<QueueItemId, QueueError>;

    /// Pop the next ready work item, if any.
    fn dequeue(&self) -> Result<Option<QueueItem>, QueueError>;
}

impl<Q: QueueTransport + ?Sized> QueueTransport for Arc<Q> {
    fn enqueue(&self, item: QueueItem, delay: Option<Duration>) -> Result<QueueItemId, QueueError> {
        (**self).enqueue(item, delay)
    }

    fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        (**self).dequeue()
    }
}

/// In-memory FIFO transport for tests/dev.
///
/// Delayed items become visible once the injected [`Clock`] passes their
/// deadline.
pub struct InMemoryQueue {
    clock: Arc<dyn Clock>,
    ready: Mutex<VecDeque<QueueItem>>,
    delayed: Mutex<Vec<(Instant, QueueItem)>>,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ready: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
        }
    }

    /// Number of items not yet dequeued (ready + delayed). Test helper.
    pub fn len(&self) -> usize {
        self.ready.lock().unwrap().len() + self.delayed.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn promote_due(&self) {
        let now = self.clock.now();
        let mut delayed = self.delayed.lock().unwrap();
        let mut ready = self.ready.lock().unwrap();

        let mut index = 0;
        while index < delayed.len() {
            if delayed[index].0 <= now {
                let (_, item) = delayed.remove(index);
                ready.push_back(item);
            } else {
                index += 1;
            }
        }
    }
}

impl QueueTransport for InMemoryQueue {
    fn enqueue(&self, item: QueueItem, delay: Option<Duration>) -> Result<QueueItemId, QueueError> {
        let id = item.id;
        match delay {
            Some(delay) if !delay.is_zero() => {
                let deadline = self.clock.now() + delay;
                self.delayed.lock().unwrap().push((deadline, item));
            }
            _ => self.ready.lock().unwrap().push_back(item),
        }
        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        self.promote_due();
        Ok(self.ready.lock().unwrap().pop_front())
    }
}
