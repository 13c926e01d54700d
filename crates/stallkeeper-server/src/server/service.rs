//! One runnable admission service.
//!
//! [`StallService::new`] creates the inbound FIFO and every shared
//! component; [`StallService::run`] arms the run-duration timer, drives the
//! listener to completion, waits for every in-flight worker and then closes
//! both pools. The inbound FIFO is removed on shutdown, or when the service
//! is dropped if shutdown never happened.

use crate::server::{
    admission::AdmissionController,
    config::ServerConfig,
    events::EventSink,
    listener::{Listener, ListenerTiming},
    pool::{TrackedSpawner, WorkerContext},
    shutdown::ShutdownCoordinator,
};
use stallkeeper_core::{
    Result,
    fifo::{FifoGuard, create_fifo, open_inbound_receiver},
};
use std::sync::Arc;
use tokio::net::unix::pipe;
use tokio_util::task::TaskTracker;

pub struct StallService {
    config: ServerConfig,
    inbound: Arc<FifoGuard>,
    receiver: pipe::Receiver,
    controller: Arc<AdmissionController>,
    coordinator: Arc<ShutdownCoordinator>,
    events: Arc<dyn EventSink>,
    tracker: TaskTracker,
}

impl StallService {
    /// Creates the inbound FIFO and opens it for reading.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](stallkeeper_core::Error::Io) if the FIFO cannot
    /// be created (for example because the path already exists) or opened.
    pub fn new(config: ServerConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let inbound = Arc::new(create_fifo(&config.inbound_path)?);
        let receiver = open_inbound_receiver(inbound.path())?;

        Ok(Self {
            controller: Arc::new(AdmissionController::new(
                config.worker_limit,
                config.resource_limit,
            )),
            coordinator: Arc::new(ShutdownCoordinator::new(Arc::clone(&inbound))),
            config,
            inbound,
            receiver,
            events,
            tracker: TaskTracker::new(),
        })
    }

    pub fn controller(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.controller)
    }

    /// Handle for triggering shutdown early, e.g. from a signal handler.
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Serves requests for the configured run time, drains, and waits for
    /// every worker to finish.
    ///
    /// # Errors
    ///
    /// Returns the listener's fatal error, if any. Shutdown is still
    /// triggered and in-flight workers still complete in that case.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            inbound,
            receiver,
            controller,
            coordinator,
            events,
            tracker,
        } = self;

        tracing::info!(
            "Accepting requests on {} for {:?} (workers: {:?}, places: {:?})",
            inbound.path().display(),
            config.run_for,
            config.worker_limit,
            config.resource_limit,
        );

        let timer = coordinator.arm(config.run_for);

        let ctx = Arc::new(WorkerContext {
            shutdown: coordinator.signal(),
            events: Arc::clone(&events),
            reply_dir: config.reply_dir.clone(),
        });
        let spawner = Arc::new(TrackedSpawner::new(tracker.clone(), ctx));

        let listener = Listener::new(
            receiver,
            Arc::clone(&controller),
            coordinator.signal(),
            events,
            spawner,
            ListenerTiming::from(&config),
        );

        let result = listener.run().await;
        if let Err(e) = &result {
            tracing::error!("Listener stopped: {e}");
        }

        if !coordinator.has_fired() {
            tracing::warn!("Listener stopped before the run time elapsed");
            coordinator.trigger();
        }
        if let Err(e) = timer.await {
            tracing::warn!("Shutdown timer task failed: {e}");
        }

        tracker.close();
        tracing::debug!("Waiting for {} in-flight workers", tracker.len());
        tracker.wait().await;
        controller.close();

        tracing::info!("All workers finished");
        result
    }
}
