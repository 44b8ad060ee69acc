//! Durable lifecycle records for logical jobs.
//!
//! One open record per (actor, kind, argument signature) triple while the
//! job is outstanding; terminal rows are retained as history. Creation is
//! idempotent: re-submitting before completion returns the existing record,
//! and a racing creator recovers by refetching instead of surfacing a
//! duplicate-key error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tallyforge_core::UserId;

use crate::identity::{Fingerprint, JobKind};

/// Lifecycle state of a logical job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for pickup.
    Queued,
    /// An invocation is executing.
    Executing,
    /// Finished cleanly.
    Succeeded,
    /// A stage failed.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Lifecycle record for one logical job.
///
/// A superseded invocation performs no transition here; the newer instance
/// finalizes the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: Uuid,
    pub actor: UserId,
    pub kind: JobKind,
    pub arg_signature: Fingerprint,
    pub state: JobState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    #[error("status store unavailable: {0}")]
    Unavailable(String),
}

/// Store abstraction for status records.
///
/// Transitions on an absent record are no-ops: jobs without an identifiable
/// actor run without tracking.
pub trait StatusStore: Send + Sync {
    /// Return the open record for the triple, creating it (state `Queued`)
    /// if none exists. The store's uniqueness constraint is the source of
    /// truth when creators race; the loser fetches the winner's record.
    fn find_or_create(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<StatusRecord, StatusError>;

    /// Fetch the open record for the triple, if any.
    fn get_open(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<Option<StatusRecord>, StatusError>;

    /// Transition `Queued -> Executing`.
    fn mark_executing(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError>;

    /// Transition `Executing -> Succeeded` and close the record.
    fn mark_succeeded(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError>;

    /// Transition `Executing -> Failed`, recording the error, and close the
    /// record.
    fn mark_failed(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
        error: &str,
    ) -> Result<(), StatusError>;
}

impl<S: StatusStore + ?Sized> StatusStore for Arc<S> {
    fn find_or_create(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<StatusRecord, StatusError> {
        (**self).find_or_create(actor, kind, signature)
    }

    fn get_open(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<Option<StatusRecord>, StatusError> {
        (**self).get_open(actor, kind, signature)
    }

    fn mark_executing(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        (**self).mark_executing(actor, kind, signature)
    }

    fn mark_succeeded(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        (**self).mark_succeeded(actor, kind, signature)
    }

    fn mark_failed(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
        error: &str,
    ) -> Result<(), StatusError> {
        (**self).mark_failed(actor, kind, signature, error)
    }
}

type TripleKey = (UserId, JobKind, Fingerprint);

/// In-memory status store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    open: Mutex<HashMap<TripleKey, StatusRecord>>,
    history: Mutex<Vec<StatusRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal rows, oldest first. Test helper.
    pub fn history(&self) -> Vec<StatusRecord> {
        self.history.lock().unwrap().clone()
    }

    fn close(&self, key: &TripleKey, state: JobState, error: Option<String>) {
        let mut open = self.open.lock().unwrap();
        if let Some(mut record) = open.remove(key) {
            record.state = state;
            record.error = error;
            record.updated_at = Utc::now();
            self.history.lock().unwrap().push(record);
        }
    }
}

impl StatusStore for InMemoryStatusStore {
    fn find_or_create(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<StatusRecord, StatusError> {
        let key = (actor, kind.clone(), signature.clone());
        let mut open = self.open.lock().unwrap();

        // Atomic under the map lock: the racing creator sees the winner's row.
        let record = open.entry(key).or_insert_with(|| {
            let now = Utc::now();
            StatusRecord {
                id: Uuid::now_v7(),
                actor,
                kind: kind.clone(),
                arg_signature: signature.clone(),
                state: JobState::Queued,
                error: None,
                created_at: now,
                updated_at: now,
            }
        });

        Ok(record.clone())
    }

    fn get_open(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<Option<StatusRecord>, StatusError> {
        let key = (actor, kind.clone(), signature.clone());
        Ok(self.open.lock().unwrap().get(&key).cloned())
    }

    fn mark_executing(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        let key = (actor, kind.clone(), signature.clone());
        if let Some(record) = self.open.lock().unwrap().get_mut(&key) {
            record.state = JobState::Executing;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    fn mark_succeeded(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        self.close(
            &(actor, kind.clone(), signature.clone()),
            JobState::Succeeded,
            None,
        );
        Ok(())
    }

    fn mark_failed(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
        error: &str,
    ) -> Result<(), StatusError> {
        self.close(
            &(actor, kind.clone(), signature.clone()),
            JobState::Failed,
            Some(error.to_string()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{JobIdentity, JobKind};
    use serde_json::json;

    fn test_actor() -> UserId {
        UserId::new()
    }

    fn test_signature() -> Fingerprint {
        JobIdentity::new(JobKind::new("recompute.ledger"), vec![json!(1)]).fingerprint()
    }

    #[test]
    fn find_or_create_is_idempotent_while_open() {
        let store = InMemoryStatusStore::new();
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        let first = store.find_or_create(actor, &kind, &signature).unwrap();
        let second = store.find_or_create(actor, &kind, &signature).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.state, JobState::Queued);
    }

    #[test]
    fn racing_creators_converge_on_one_record() {
        let store = Arc::new(InMemoryStatusStore::new());
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let kind = kind.clone();
                let signature = signature.clone();
                std::thread::spawn(move || store.find_or_create(actor, &kind, &signature).unwrap())
            })
            .collect();

        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap().id).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn lifecycle_transitions_and_history() {
        let store = InMemoryStatusStore::new();
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        store.find_or_create(actor, &kind, &signature).unwrap();
        store.mark_executing(actor, &kind, &signature).unwrap();
        assert_eq!(
            store.get_open(actor, &kind, &signature).unwrap().unwrap().state,
            JobState::Executing
        );

        store.mark_succeeded(actor, &kind, &signature).unwrap();
        assert!(store.get_open(actor, &kind, &signature).unwrap().is_none());

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Succeeded);
    }

    #[test]
    fn completion_reopens_the_identity() {
        let store = InMemoryStatusStore::new();
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        let first = store.find_or_create(actor, &kind, &signature).unwrap();
        store.mark_executing(actor, &kind, &signature).unwrap();
        store.mark_succeeded(actor, &kind, &signature).unwrap();

        let second = store.find_or_create(actor, &kind, &signature).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.state, JobState::Queued);
    }

    #[test]
    fn transitions_without_a_record_are_no_ops() {
        let store = InMemoryStatusStore::new();
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        store.mark_executing(actor, &kind, &signature).unwrap();
        store.mark_failed(actor, &kind, &signature, "boom").unwrap();

        assert!(store.get_open(actor, &kind, &signature).unwrap().is_none());
        assert!(store.history().is_empty());
    }

    #[test]
    fn failure_records_the_error() {
        let store = InMemoryStatusStore::new();
        let actor = test_actor();
        let kind = JobKind::new("recompute.ledger");
        let signature = test_signature();

        store.find_or_create(actor, &kind, &signature).unwrap();
        store.mark_executing(actor, &kind, &signature).unwrap();
        store
            .mark_failed(actor, &kind, &signature, "stage 'rebuild' exploded")
            .unwrap();

        let history = store.history();
        assert_eq!(history[0].state, JobState::Failed);
        assert_eq!(history[0].error.as_deref(), Some("stage 'rebuild' exploded"));
    }
}
