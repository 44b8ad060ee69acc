//! Cooperative, rate-limited supersession checks.
//!
//! A long-running invocation polls at stage boundaries (and optionally
//! mid-stage). The underlying checks - lock-state query and the external
//! change probe - run at most once per guard interval; calls inside the
//! interval are free no-ops, so staleness is bounded by the interval.
//!
//! Cancellation is advisory: a stage between poll points cannot be stopped
//! and must be safe to let run to its next boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{BoxError, Superseded};
use crate::identity::{Fingerprint, JobArgs};
use crate::lock::LockRegistry;

/// Default minimum time between actual checks.
pub const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_secs(5);

/// Which checks a poll performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Do not poll at this boundary (e.g. before the first data-mutating
    /// stage, whose own effects would trip the change probe).
    Skip,
    /// Check for a fresh `queued` reservation only.
    Locks,
    /// Check the lock state and the external change probe.
    LocksAndProbe,
}

/// Cheap signal that upstream data this job depends on has moved since the
/// last check (e.g. a monotonically increasing transaction count). A change
/// means the invocation's results would be stale anyway.
pub trait ChangeProbe: Send + Sync {
    fn current(&self, args: &JobArgs) -> Result<u64, BoxError>;
}

/// Per-invocation poll state: the timestamp of the last actual check plus
/// the cached probe value. Never persisted; owned by the stage pipeline and
/// discarded when the invocation returns.
#[derive(Debug, Default)]
pub struct CancellationToken {
    last_checked: Option<Instant>,
    last_probe: Option<u64>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Polls lock state (and optionally a change probe) on behalf of one
/// invocation.
pub struct CancellationGuard {
    locks: Arc<dyn LockRegistry>,
    clock: Arc<dyn Clock>,
    fingerprint: Fingerprint,
    args: JobArgs,
    probe: Option<Arc<dyn ChangeProbe>>,
    interval: Duration,
}

impl CancellationGuard {
    pub fn new(
        locks: Arc<dyn LockRegistry>,
        clock: Arc<dyn Clock>,
        fingerprint: Fingerprint,
        args: JobArgs,
        probe: Option<Arc<dyn ChangeProbe>>,
        interval: Duration,
    ) -> Self {
        Self {
            locks,
            clock,
            fingerprint,
            args,
            probe,
            interval,
        }
    }

    /// Check whether this invocation has been superseded.
    ///
    /// Fails with [`Superseded`] when a fresher equivalent submission holds
    /// a `queued` reservation, or when the change probe reports movement
    /// since the last check. Both checks are skipped entirely when less than
    /// the guard interval has elapsed since the token's last actual check.
    pub fn poll(&self, token: &mut CancellationToken, mode: GuardMode) -> Result<(), Superseded> {
        if matches!(mode, GuardMode::Skip) {
            return Ok(());
        }

        let now = self.clock.now();
        if let Some(last) = token.last_checked {
            if now.duration_since(last) < self.interval {
                return Ok(());
            }
        }
        token.last_checked = Some(now);

        // Requeue check: a fresh `queued` reservation means a newer
        // equivalent job will redo this work.
        match self.locks.is_queued(&self.fingerprint) {
            Ok(true) => {
                debug!(
                    fingerprint = %self.fingerprint,
                    "fresh queued reservation observed; yielding"
                );
                return Err(Superseded);
            }
            Ok(false) => {}
            // Read query: assume not reserved when the store is unreachable.
            Err(e) => warn!(
                fingerprint = %self.fingerprint,
                error = %e,
                "lock store read failed during poll"
            ),
        }

        if matches!(mode, GuardMode::LocksAndProbe) {
            if let Some(probe) = &self.probe {
                match probe.current(&self.args) {
                    Ok(value) => match token.last_probe {
                        Some(previous) if previous != value => {
                            debug!(
                                fingerprint = %self.fingerprint,
                                previous,
                                current = value,
                                "change probe moved; yielding"
                            );
                            token.last_probe = Some(value);
                            return Err(Superseded);
                        }
                        _ => token.last_probe = Some(value),
                    },
                    // The probe is advisory; treat a failed read as unchanged.
                    Err(e) => warn!(
                        fingerprint = %self.fingerprint,
                        error = %e,
                        "change probe failed during poll"
                    ),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{JobIdentity, JobKind};
    use crate::lock::InMemoryLockRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    const TTL: Duration = Duration::from_secs(3600);

    struct CountProbe(AtomicU64);

    impl ChangeProbe for CountProbe {
        fn current(&self, _args: &JobArgs) -> Result<u64, BoxError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        locks: Arc<InMemoryLockRegistry>,
        fingerprint: Fingerprint,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let locks = Arc::new(InMemoryLockRegistry::new(clock.clone()));
        let fingerprint =
            JobIdentity::new(JobKind::new("recompute.ledger"), vec![json!(1)]).fingerprint();
        Fixture {
            clock,
            locks,
            fingerprint,
        }
    }

    fn guard(fixture: &Fixture, probe: Option<Arc<dyn ChangeProbe>>) -> CancellationGuard {
        CancellationGuard::new(
            fixture.locks.clone(),
            fixture.clock.clone(),
            fixture.fingerprint.clone(),
            JobArgs::empty(),
            probe,
            DEFAULT_GUARD_INTERVAL,
        )
    }

    #[test]
    fn poll_passes_when_nothing_superseded_the_job() {
        let fixture = fixture();
        let guard = guard(&fixture, None);
        let mut token = CancellationToken::new();

        assert!(guard.poll(&mut token, GuardMode::Locks).is_ok());
    }

    #[test]
    fn fresh_queued_reservation_supersedes_the_invocation() {
        let fixture = fixture();
        let guard = guard(&fixture, None);
        let mut token = CancellationToken::new();

        assert!(guard.poll(&mut token, GuardMode::Locks).is_ok());

        fixture
            .locks
            .try_reserve_queued(&fixture.fingerprint, TTL)
            .unwrap();
        fixture.clock.advance(DEFAULT_GUARD_INTERVAL);

        assert_eq!(guard.poll(&mut token, GuardMode::Locks), Err(Superseded));
    }

    #[test]
    fn polls_inside_the_interval_do_not_recheck() {
        let fixture = fixture();
        let guard = guard(&fixture, None);
        let mut token = CancellationToken::new();

        assert!(guard.poll(&mut token, GuardMode::Locks).is_ok());

        // Conditions change, but the next poll lands inside the interval:
        // staleness is bounded by the interval, not zero.
        fixture
            .locks
            .try_reserve_queued(&fixture.fingerprint, TTL)
            .unwrap();
        fixture.clock.advance(Duration::from_secs(1));
        assert!(guard.poll(&mut token, GuardMode::Locks).is_ok());

        fixture.clock.advance(DEFAULT_GUARD_INTERVAL);
        assert_eq!(guard.poll(&mut token, GuardMode::Locks), Err(Superseded));
    }

    #[test]
    fn skip_mode_never_checks() {
        let fixture = fixture();
        let guard = guard(&fixture, None);
        let mut token = CancellationToken::new();

        fixture
            .locks
            .try_reserve_queued(&fixture.fingerprint, TTL)
            .unwrap();
        fixture.clock.advance(DEFAULT_GUARD_INTERVAL * 3);

        assert!(guard.poll(&mut token, GuardMode::Skip).is_ok());
    }

    #[test]
    fn probe_movement_supersedes_the_invocation() {
        let fixture = fixture();
        let probe = Arc::new(CountProbe(AtomicU64::new(10)));
        let guard = guard(&fixture, Some(probe.clone()));
        let mut token = CancellationToken::new();

        // First observation establishes the baseline.
        assert!(guard.poll(&mut token, GuardMode::LocksAndProbe).is_ok());

        probe.0.store(11, Ordering::SeqCst);
        fixture.clock.advance(DEFAULT_GUARD_INTERVAL);

        assert_eq!(
            guard.poll(&mut token, GuardMode::LocksAndProbe),
            Err(Superseded)
        );
    }

    #[test]
    fn locks_mode_ignores_the_probe() {
        let fixture = fixture();
        let probe = Arc::new(CountProbe(AtomicU64::new(10)));
        let guard = guard(&fixture, Some(probe.clone()));
        let mut token = CancellationToken::new();

        assert!(guard.poll(&mut token, GuardMode::LocksAndProbe).is_ok());

        probe.0.store(99, Ordering::SeqCst);
        fixture.clock.advance(DEFAULT_GUARD_INTERVAL);

        assert!(guard.poll(&mut token, GuardMode::Locks).is_ok());
    }
}
