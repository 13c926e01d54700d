use super::worker::{self, WorkerContext, WorkerJob};
use std::{fmt, sync::Arc};
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

/// Starts one detached worker per job.
pub trait Spawn: Send + Sync {
    /// Starts a worker for `job`.
    ///
    /// # Errors
    ///
    /// Returns the job inside a [`SpawnError`] if no worker could be started,
    /// so the caller can retry or release its admission.
    fn spawn(&self, job: WorkerJob) -> Result<(), SpawnError>;
}

/// A job that could not be started, handed back to the caller.
#[derive(Debug)]
pub struct SpawnError {
    pub job: WorkerJob,
    pub reason: String,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "couldn't start worker for request {}: {}",
            self.job.request.id, self.reason
        )
    }
}

/// Spawns workers on the current Tokio runtime and tracks them.
pub struct TrackedSpawner {
    tracker: TaskTracker,
    ctx: Arc<WorkerContext>,
}

impl TrackedSpawner {
    pub const fn new(tracker: TaskTracker, ctx: Arc<WorkerContext>) -> Self {
        Self { tracker, ctx }
    }
}

impl Spawn for TrackedSpawner {
    fn spawn(&self, job: WorkerJob) -> Result<(), SpawnError> {
        if self.tracker.is_closed() {
            return Err(SpawnError {
                job,
                reason: "worker tracker is closed".to_string(),
            });
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                return Err(SpawnError {
                    job,
                    reason: e.to_string(),
                });
            }
        };

        self.tracker
            .spawn_on(worker::run(job, Arc::clone(&self.ctx)), &handle);
        Ok(())
    }
}
