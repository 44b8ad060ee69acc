//! Distributed lock registry keyed by job fingerprint.
//!
//! Two independent reservations per fingerprint:
//!
//! - `queued`: held between submission and pickup
//! - `running`: held between pickup and terminal outcome
//!
//! A fresh `queued` reservation *can* be taken while an invocation is
//! running; that is how a running invocation learns it has been superseded
//! (its next guard poll observes the new reservation and yields). Mutual
//! exclusion of execution comes from the `running` slot alone.
//!
//! Both entries carry TTLs so a crashed worker's reservations eventually
//! expire. That is a liveness safety net, not a correctness guarantee.
//!
//! All operations are non-blocking test-and-set against the shared store;
//! callers never read-then-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::identity::Fingerprint;

/// Lock store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The underlying shared store is unreachable. Read queries may fall
    /// back to "assume not reserved"; reserve/release must treat this as a
    /// hard failure.
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// Mutual-exclusion facility shared by all worker processes.
pub trait LockRegistry: Send + Sync {
    /// Reserve the `queued` slot. Returns `false` when the identity already
    /// has a pending reservation.
    fn try_reserve_queued(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Drop the `queued` reservation (called at pickup). Absent entries are
    /// a no-op.
    fn release_queued(&self, fingerprint: &Fingerprint) -> Result<(), LockError>;

    /// Take the `running` slot. Returns `false` when another invocation of
    /// the same identity is already executing.
    fn try_mark_running(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Drop the `running` reservation. Called exactly once on every exit
    /// path (success, failure, or cooperative yield).
    fn release_running(&self, fingerprint: &Fingerprint) -> Result<(), LockError>;

    /// Side-effect-free query: is a `queued` reservation present?
    fn is_queued(&self, fingerprint: &Fingerprint) -> Result<bool, LockError>;

    /// Side-effect-free query: is a `running` reservation present?
    fn is_running(&self, fingerprint: &Fingerprint) -> Result<bool, LockError>;
}

impl<L: LockRegistry + ?Sized> LockRegistry for Arc<L> {
    fn try_reserve_queued(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        (**self).try_reserve_queued(fingerprint, ttl)
    }

    fn release_queued(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        (**self).release_queued(fingerprint)
    }

    fn try_mark_running(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        (**self).try_mark_running(fingerprint, ttl)
    }

    fn release_running(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        (**self).release_running(fingerprint)
    }

    fn is_queued(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        (**self).is_queued(fingerprint)
    }

    fn is_running(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        (**self).is_running(fingerprint)
    }
}

/// In-memory lock registry for tests/dev.
///
/// TTL expiry is driven by the injected [`Clock`] so tests can advance time
/// deterministically.
pub struct InMemoryLockRegistry {
    clock: Arc<dyn Clock>,
    queued: Mutex<HashMap<Fingerprint, Instant>>,
    running: Mutex<HashMap<Fingerprint, Instant>>,
}

impl InMemoryLockRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queued: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn try_set(
        &self,
        slot: &Mutex<HashMap<Fingerprint, Instant>>,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> bool {
        let now = self.clock.now();
        let mut entries = slot.lock().unwrap();
        match entries.get(fingerprint) {
            Some(deadline) if *deadline > now => false,
            _ => {
                entries.insert(fingerprint.clone(), now + ttl);
                true
            }
        }
    }

    fn exists(&self, slot: &Mutex<HashMap<Fingerprint, Instant>>, fingerprint: &Fingerprint) -> bool {
        let now = self.clock.now();
        let mut entries = slot.lock().unwrap();
        match entries.get(fingerprint) {
            Some(deadline) if *deadline > now => true,
            Some(_) => {
                // Expired; prune lazily.
                entries.remove(fingerprint);
                false
            }
            None => false,
        }
    }
}

impl LockRegistry for InMemoryLockRegistry {
    fn try_reserve_queued(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(self.try_set(&self.queued, fingerprint, ttl))
    }

    fn release_queued(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        self.queued.lock().unwrap().remove(fingerprint);
        Ok(())
    }

    fn try_mark_running(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(self.try_set(&self.running, fingerprint, ttl))
    }

    fn release_running(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        self.running.lock().unwrap().remove(fingerprint);
        Ok(())
    }

    fn is_queued(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        Ok(self.exists(&self.queued, fingerprint))
    }

    fn is_running(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        Ok(self.exists(&self.running, fingerprint))
    }
}
