//! Background worker: drives pickups from the queue transport.
//!
//! Multiple workers (across processes) pull from the shared transport and
//! invoke [`JobOrchestrator::run_now`] for each item; the lock registry
//! keeps concurrent pickups of one identity mutually exclusive.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::orchestrator::{JobOrchestrator, RunOutcome};
use crate::queue::QueueTransport;
use crate::status::StatusStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll when the queue is empty.
    pub poll_interval: Duration,
    /// Name for logging and the worker thread.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Snapshot of the worker's runtime statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub superseded: u64,
    pub rescheduled: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Background job worker.
///
/// The transport owns retries and dead-lettering of failed items; the
/// worker only reports outcomes.
pub struct JobWorker;

impl JobWorker {
    /// Spawn the worker in a background thread.
    pub fn spawn<S, Q>(
        orchestrator: Arc<JobOrchestrator<S, Q>>,
        transport: Q,
        config: WorkerConfig,
    ) -> WorkerHandle
    where
        S: StatusStore + 'static,
        Q: QueueTransport + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();
        let name = config.name.clone();

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(orchestrator, transport, config, shutdown_rx, stats_clone))
            .expect("failed to spawn job worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<S, Q>(
    orchestrator: Arc<JobOrchestrator<S, Q>>,
    transport: Q,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: StatusStore,
    Q: QueueTransport,
{
    info!(worker = %config.name, "job worker started");

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match transport.dequeue() {
            Ok(Some(item)) => {
                debug!(
                    worker = %config.name,
                    item_id = %item.id,
                    kind = %item.kind,
                    "picked up work item"
                );

                let outcome = orchestrator.run_now(&item.kind, item.args);

                let mut s = stats.lock().unwrap();
                s.processed += 1;
                match outcome {
                    Ok(RunOutcome::Completed) => s.completed += 1,
                    Ok(RunOutcome::Superseded) => s.superseded += 1,
                    Ok(RunOutcome::Rescheduled) => s.rescheduled += 1,
                    Ok(RunOutcome::Dropped) => s.dropped += 1,
                    Err(err) => {
                        s.failed += 1;
                        // Re-raised to the transport's retry/alerting policy.
                        error!(
                            worker = %config.name,
                            item_id = %item.id,
                            error = %err,
                            "work item failed"
                        );
                    }
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to dequeue");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(worker = %config.name, "job worker stopped");
}
