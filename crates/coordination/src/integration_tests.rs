//! Integration tests for the full coordination pipeline.
//!
//! Tests: submit -> lock reservation -> queue -> pickup -> stages -> status
//!
//! Verifies:
//! - Duplicate submissions resolve per the declared conflict policy
//! - At most one invocation of an identity executes at a time
//! - A running invocation yields to a fresher submission at its next poll
//! - Locks and status records are finalized on every exit path

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use serde_json::json;

    use tallyforge_core::UserId;

    use crate::clock::ManualClock;
    use crate::guard::{GuardMode, DEFAULT_GUARD_INTERVAL};
    use crate::identity::{JobArgs, JobKind, KeyArgSelector};
    use crate::lock::{InMemoryLockRegistry, LockRegistry};
    use crate::orchestrator::{JobOrchestrator, OrchestratorConfig, RunOutcome, SubmitOutcome};
    use crate::queue::{InMemoryQueue, QueueTransport};
    use crate::registry::{ConflictPolicy, JobDefinition, JobRegistry};
    use crate::stage::{ProcessingStage, StageContext, StageError};
    use crate::status::{InMemoryStatusStore, JobState, StatusStore};
    use crate::worker::{JobWorker, WorkerConfig};
    use crate::CoordinationError;

    type TestOrchestrator = JobOrchestrator<Arc<InMemoryStatusStore>, Arc<InMemoryQueue>>;

    struct Harness {
        clock: Arc<ManualClock>,
        locks: Arc<InMemoryLockRegistry>,
        status: Arc<InMemoryStatusStore>,
        queue: Arc<InMemoryQueue>,
        orchestrator: Arc<TestOrchestrator>,
    }

    fn harness(build_registry: impl FnOnce(&mut JobRegistry)) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let locks = Arc::new(InMemoryLockRegistry::new(clock.clone()));
        let status = Arc::new(InMemoryStatusStore::new());
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));

        let mut registry = JobRegistry::new();
        build_registry(&mut registry);

        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(registry),
            locks.clone(),
            status.clone(),
            queue.clone(),
            clock.clone(),
            OrchestratorConfig::default(),
        ));

        Harness {
            clock,
            locks,
            status,
            queue,
            orchestrator,
        }
    }

    /// Run every currently-ready work item to completion.
    fn drain(harness: &Harness) -> Vec<RunOutcome> {
        let mut outcomes = Vec::new();
        while let Some(item) = harness.queue.dequeue().unwrap() {
            match harness.orchestrator.run_now(&item.kind, item.args) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => panic!("unexpected run failure: {err}"),
            }
        }
        outcomes
    }

    struct CountingStage(Arc<AtomicUsize>);

    impl ProcessingStage for CountingStage {
        fn run(&self, _ctx: &mut StageContext<'_>) -> Result<(), StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recompute_definition(ran: Arc<AtomicUsize>) -> JobDefinition {
        JobDefinition::new("recompute.ledger")
            .with_actor_arg(0)
            .with_key_args(KeyArgSelector::Positions(vec![0]))
            .with_stage("rebuild", GuardMode::Skip, Arc::new(CountingStage(ran.clone())))
            .with_stage("aggregate", GuardMode::Locks, Arc::new(CountingStage(ran)))
    }

    fn user_args(actor: UserId) -> JobArgs {
        JobArgs::new(vec![json!(actor.to_string())])
    }

    #[test]
    fn submit_then_pickup_completes_and_finalizes_everything() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry.register(recompute_definition(ran.clone())).unwrap();
        });

        let kind = JobKind::new("recompute.ledger");
        let actor = UserId::new();
        let args = user_args(actor);

        let outcome = harness.orchestrator.submit(&kind, args.clone()).unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
        assert!(harness.orchestrator.is_queued(&kind, &args).unwrap());
        assert_eq!(
            harness
                .orchestrator
                .status_of(&kind, &args)
                .unwrap()
                .unwrap()
                .state,
            JobState::Queued
        );

        assert_eq!(drain(&harness), vec![RunOutcome::Completed]);
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        // Locks fully released, status archived as succeeded.
        assert!(!harness.orchestrator.is_queued(&kind, &args).unwrap());
        assert!(!harness.orchestrator.is_running(&kind, &args).unwrap());
        assert!(harness.orchestrator.status_of(&kind, &args).unwrap().is_none());

        let history = harness.status.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Succeeded);
    }

    #[test]
    fn duplicate_submission_reschedules_and_distinct_identity_is_independent() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry.register(recompute_definition(ran)).unwrap();
        });

        let kind = JobKind::new("recompute.ledger");
        let user_one = user_args(UserId::new());
        let user_two = user_args(UserId::new());

        assert_eq!(
            harness.orchestrator.submit(&kind, user_one.clone()).unwrap(),
            SubmitOutcome::Accepted
        );
        // Same identity before pickup: a second enqueue, not an error.
        assert_eq!(
            harness.orchestrator.submit(&kind, user_one.clone()).unwrap(),
            SubmitOutcome::Rescheduled
        );
        assert_eq!(harness.queue.len(), 2);

        // Different key arguments fingerprint independently.
        assert_eq!(
            harness.orchestrator.submit(&kind, user_two).unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(harness.queue.len(), 3);

        // Re-submission while open reuses the status record.
        let record = harness.orchestrator.status_of(&kind, &user_one).unwrap().unwrap();
        assert_eq!(record.state, JobState::Queued);
    }

    #[test]
    fn drop_policy_deduplicates_conflicting_submissions() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry
                .register(
                    JobDefinition::new("snapshot.balances")
                        .with_conflict_policy(ConflictPolicy::Drop)
                        .with_stage("snapshot", GuardMode::Skip, Arc::new(CountingStage(ran))),
                )
                .unwrap();
        });

        let kind = JobKind::new("snapshot.balances");
        let args = JobArgs::new(vec![json!(42)]);

        assert_eq!(
            harness.orchestrator.submit(&kind, args.clone()).unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            harness.orchestrator.submit(&kind, args).unwrap(),
            SubmitOutcome::Deduplicated
        );
        assert_eq!(harness.queue.len(), 1);
    }

    #[test]
    fn concurrent_submissions_reserve_exactly_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry.register(recompute_definition(ran)).unwrap();
        });

        let actor = UserId::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = harness.orchestrator.clone();
                let args = user_args(actor);
                std::thread::spawn(move || {
                    orchestrator
                        .submit(&JobKind::new("recompute.ledger"), args)
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<SubmitOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted = outcomes
            .iter()
            .filter(|o| **o == SubmitOutcome::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SubmitOutcome::Accepted | SubmitOutcome::Rescheduled)));
    }

    #[test]
    fn fresher_submission_supersedes_a_running_invocation() {
        // Stage that submits the same identity mid-run (once) and advances
        // the clock past the guard interval, so the next poll boundary
        // yields. The second invocation passes straight through.
        struct ResubmittingStage {
            orchestrator: OnceLock<Arc<TestOrchestrator>>,
            clock: Arc<ManualClock>,
            args: JobArgs,
            fired: std::sync::atomic::AtomicBool,
        }

        impl ProcessingStage for ResubmittingStage {
            fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
                if self.fired.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                let orchestrator = self.orchestrator.get().expect("wired in test setup");
                let outcome = orchestrator
                    .submit(ctx.kind, self.args.clone())
                    .expect("fresh submission");
                assert_eq!(outcome, SubmitOutcome::Accepted);
                self.clock.advance(DEFAULT_GUARD_INTERVAL);
                Ok(())
            }
        }

        let actor = UserId::new();
        let args = user_args(actor);
        let reached_last = Arc::new(AtomicUsize::new(0));

        let clock = Arc::new(ManualClock::new());
        let stage = Arc::new(ResubmittingStage {
            orchestrator: OnceLock::new(),
            clock: clock.clone(),
            args: args.clone(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });

        let locks = Arc::new(InMemoryLockRegistry::new(clock.clone()));
        let status = Arc::new(InMemoryStatusStore::new());
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));

        let mut registry = JobRegistry::new();
        registry
            .register(
                JobDefinition::new("recompute.ledger")
                    .with_actor_arg(0)
                    .with_key_args(KeyArgSelector::Positions(vec![0]))
                    .with_stage("rebuild", GuardMode::Skip, stage.clone())
                    .with_stage("match", GuardMode::Locks, Arc::new(CountingStage(Arc::new(AtomicUsize::new(0)))))
                    .with_stage(
                        "aggregate",
                        GuardMode::Locks,
                        Arc::new(CountingStage(reached_last.clone())),
                    ),
            )
            .unwrap();

        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(registry),
            locks.clone(),
            status.clone(),
            queue.clone(),
            clock.clone(),
            OrchestratorConfig::default(),
        ));
        stage
            .orchestrator
            .set(orchestrator.clone())
            .ok()
            .expect("wired once");

        let kind = JobKind::new("recompute.ledger");
        assert_eq!(
            orchestrator.submit(&kind, args.clone()).unwrap(),
            SubmitOutcome::Accepted
        );

        let item = queue.dequeue().unwrap().unwrap();
        let outcome = orchestrator.run_now(&item.kind, item.args).unwrap();
        assert_eq!(outcome, RunOutcome::Superseded);

        // The later stages never ran.
        assert_eq!(reached_last.load(Ordering::SeqCst), 0);

        // Running lock released; the fresh reservation still pending; the
        // status record is left in Executing for the newer instance.
        assert!(!orchestrator.is_running(&kind, &args).unwrap());
        assert!(orchestrator.is_queued(&kind, &args).unwrap());
        let fingerprint = {
            let record = orchestrator.status_of(&kind, &args).unwrap().unwrap();
            assert_eq!(record.state, JobState::Executing);
            record.arg_signature
        };

        // The newer instance runs to completion and finalizes the record.
        let item = queue.dequeue().unwrap().unwrap();
        assert_eq!(
            orchestrator.run_now(&item.kind, item.args).unwrap(),
            RunOutcome::Completed
        );
        assert!(status
            .get_open(actor, &kind, &fingerprint)
            .unwrap()
            .is_none());
        assert_eq!(status.history().last().unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn stage_failure_marks_the_status_failed_and_re_raises() {
        struct FailingStage;

        impl ProcessingStage for FailingStage {
            fn run(&self, _ctx: &mut StageContext<'_>) -> Result<(), StageError> {
                Err(StageError::failed("balance rows disagree"))
            }
        }

        let harness = harness(|registry| {
            registry
                .register(
                    JobDefinition::new("recompute.ledger")
                        .with_actor_arg(0)
                        .with_key_args(KeyArgSelector::Positions(vec![0]))
                        .with_stage("match", GuardMode::Skip, Arc::new(FailingStage)),
                )
                .unwrap();
        });

        let kind = JobKind::new("recompute.ledger");
        let args = user_args(UserId::new());

        harness.orchestrator.submit(&kind, args.clone()).unwrap();
        let item = harness.queue.dequeue().unwrap().unwrap();

        let err = harness
            .orchestrator
            .run_now(&item.kind, item.args)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Stage { .. }));

        // Running lock released even on failure; status archived as failed.
        assert!(!harness.orchestrator.is_running(&kind, &args).unwrap());
        let history = harness.status.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Failed);
        assert!(history[0]
            .error
            .as_deref()
            .unwrap()
            .contains("balance rows disagree"));
    }

    #[test]
    fn pickup_against_a_running_invocation_applies_the_conflict_policy() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry.register(recompute_definition(ran.clone())).unwrap();
        });

        let kind = JobKind::new("recompute.ledger");
        let args = user_args(UserId::new());

        harness.orchestrator.submit(&kind, args.clone()).unwrap();
        let item = harness.queue.dequeue().unwrap().unwrap();

        // Another worker is mid-execution of the same identity.
        let fingerprint = harness
            .orchestrator
            .status_of(&kind, &args)
            .unwrap()
            .unwrap()
            .arg_signature;
        assert!(harness
            .locks
            .try_mark_running(&fingerprint, Duration::from_secs(3600))
            .unwrap());

        let outcome = harness.orchestrator.run_now(&item.kind, item.args).unwrap();
        assert_eq!(outcome, RunOutcome::Rescheduled);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // The rescheduled item becomes visible after its delay and runs once
        // the other invocation finishes.
        harness.locks.release_running(&fingerprint).unwrap();
        assert!(harness.queue.dequeue().unwrap().is_none());
        harness.clock.advance(Duration::from_secs(11));

        assert_eq!(drain(&harness), vec![RunOutcome::Completed]);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let harness = harness(|_registry| {});

        let err = harness
            .orchestrator
            .submit(&JobKind::new("recompute.unknown"), JobArgs::empty())
            .unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownKind(_)));
    }

    #[test]
    fn background_worker_drives_submissions_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let harness = harness(|registry| {
            registry.register(recompute_definition(ran.clone())).unwrap();
        });

        let kind = JobKind::new("recompute.ledger");
        let args = user_args(UserId::new());
        harness.orchestrator.submit(&kind, args.clone()).unwrap();

        let handle = JobWorker::spawn(
            harness.orchestrator.clone(),
            harness.queue.clone(),
            WorkerConfig::default()
                .with_name("test-worker")
                .with_poll_interval(Duration::from_millis(10)),
        );

        // Wait for the worker to process the item.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.stats().processed == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(harness.status.history().len(), 1);
        assert_eq!(harness.status.history()[0].state, JobState::Succeeded);
    }
}
