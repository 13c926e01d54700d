//! The loop reading the inbound channel.
//!
//! Each iteration reserves capacity first and reads second: a worker slot,
//! then (while accepting) a resource slot, then exactly one frame. The
//! frame and its admission are handed to a worker and the loop starts over.
//!
//! The loop runs while the server is accepting or the channel may still hold
//! requests. Once shutdown fires, reads are no longer interrupted and each
//! one is bounded by the drain idle timeout; an empty or idle read marks the
//! channel drained and ends the loop.

use crate::server::{
    admission::{Admission, AdmissionController, ResourceHold},
    config::ServerConfig,
    events::{EventSink, Lifecycle, emit},
    pool::{Spawn, SpawnError, WorkerJob},
    shutdown::ShutdownSignal,
};
use stallkeeper_core::{
    Error, Result,
    fifo::{FrameReader, ReadOutcome},
    protocol::Request,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::unix::pipe, time::sleep};

/// Pauses and bounds used by the listener loop.
#[derive(Debug, Clone, Copy)]
pub struct ListenerTiming {
    /// Pause after an empty read while still accepting.
    pub eof_backoff: Duration,
    /// Longest wait for a frame in drain mode.
    pub drain_idle: Duration,
    /// Pause before the single spawn retry.
    pub spawn_retry: Duration,
}

impl From<&ServerConfig> for ListenerTiming {
    fn from(config: &ServerConfig) -> Self {
        Self {
            eof_backoff: config.eof_backoff,
            drain_idle: config.drain_idle,
            spawn_retry: config.spawn_retry,
        }
    }
}

pub struct Listener {
    receiver: pipe::Receiver,
    frames: FrameReader,
    controller: Arc<AdmissionController>,
    shutdown: ShutdownSignal,
    events: Arc<dyn EventSink>,
    spawner: Arc<dyn Spawn>,
    timing: ListenerTiming,
}

impl Listener {
    pub fn new(
        receiver: pipe::Receiver,
        controller: Arc<AdmissionController>,
        shutdown: ShutdownSignal,
        events: Arc<dyn EventSink>,
        spawner: Arc<dyn Spawn>,
        timing: ListenerTiming,
    ) -> Self {
        Self {
            receiver,
            frames: FrameReader::new(),
            controller,
            shutdown,
            events,
            spawner,
            timing,
        }
    }

    /// Reads and dispatches requests until shutdown has fired and the
    /// channel is drained.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if reading the inbound channel fails.
    /// - [`Error::Spawn`] if a worker could not be started, even on retry.
    /// - [`Error::PoolClosed`] if the admission pools were closed under it.
    ///
    /// Slots held for the failed iteration are released before returning.
    pub async fn run(mut self) -> Result<()> {
        let mut drained = false;

        while self.shutdown.is_accepting() || !drained {
            let worker = match self.controller.acquire_worker_slot(&self.shutdown).await {
                Ok(slot) => slot,
                Err(e) if e.is_interrupted() => {
                    drained = false;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let resource = if self.shutdown.is_accepting() {
                match self.controller.acquire_resource_slot(&self.shutdown).await {
                    Ok(hold) => hold,
                    Err(e) if e.is_interrupted() => {
                        worker.release();
                        drained = false;
                        continue;
                    }
                    Err(e @ Error::SlotTableExhausted { .. }) => {
                        tracing::error!("Admission invariant violated: {e}");
                        worker.release();
                        continue;
                    }
                    Err(e) => {
                        worker.release();
                        return Err(e);
                    }
                }
            } else {
                ResourceHold::Unassigned
            };

            let mut admission = Admission::new(worker, resource);

            let frame = match self.read().await {
                Ok(ReadOutcome::Frame(frame)) => frame,
                Ok(ReadOutcome::Eof) => {
                    admission.release();
                    drained = true;
                    if self.shutdown.is_accepting()
                        && self
                            .shutdown
                            .interruptible(sleep(self.timing.eof_backoff))
                            .await
                            .is_err()
                    {
                        drained = false;
                    }
                    continue;
                }
                Err(e) if e.is_interrupted() => {
                    admission.release();
                    drained = false;
                    continue;
                }
                Err(e @ Error::InvalidMessage { .. }) => {
                    tracing::warn!("Discarding inbound frame: {e}");
                    admission.release();
                    continue;
                }
                Err(e) => {
                    admission.release();
                    tracing::error!("Inbound channel failed: {e}");
                    return Err(e);
                }
            };

            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("Discarding inbound frame: {e}");
                    admission.release();
                    continue;
                }
            };

            // A frame was just present, so more may follow.
            drained = false;
            emit(self.events.as_ref(), Lifecycle::Received, &request);

            if self.shutdown.is_accepting() && !self.controller.is_resource_bounded() {
                admission.number(self.controller.next_sequence());
            }

            self.dispatch(WorkerJob::new(request, admission)).await?;
        }

        tracing::debug!("Inbound channel drained");
        Ok(())
    }

    /// Reads one frame. While accepting, shutdown interrupts the read; in
    /// drain mode an idle channel reads as end of input. A frame cut short by
    /// either branch is completed by the next call.
    async fn read(&mut self) -> Result<ReadOutcome> {
        let accepting = self.shutdown.is_accepting();

        tokio::select! {
            biased;
            outcome = self.frames.read(&mut self.receiver) => outcome,
            () = self.shutdown.stopped(), if accepting => Err(Error::Interrupted),
            () = sleep(self.timing.drain_idle), if !accepting => Ok(ReadOutcome::Eof),
        }
    }

    /// Starts a worker for `job`, retrying once.
    async fn dispatch(&self, job: WorkerJob) -> Result<()> {
        let Err(first) = self.spawner.spawn(job) else {
            return Ok(());
        };

        tracing::warn!("{first}; retrying in {:?}", self.timing.spawn_retry);
        sleep(self.timing.spawn_retry).await;

        let Err(SpawnError { job, reason }) = self.spawner.spawn(first.job) else {
            return Ok(());
        };

        tracing::error!("Giving up on request {}: {reason}", job.request.id);
        job.admission.release();
        Err(Error::Spawn { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{config::Limit, events::MemorySink};
    use parking_lot::Mutex;
    use portable_atomic::{AtomicUsize, Ordering};
    use stallkeeper_core::{
        fifo::{
            FifoGuard, PeerRole, create_fifo, open_inbound_receiver, open_inbound_sender,
            write_frame,
        },
        protocol::Frame,
    };
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    /// Fails the first `failures` spawns, then keeps every job it is given.
    #[derive(Default)]
    struct FlakySpawner {
        failures: AtomicUsize,
        jobs: Mutex<Vec<WorkerJob>>,
    }

    impl FlakySpawner {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                jobs: Mutex::default(),
            })
        }

        fn places(&self) -> Vec<i32> {
            self.jobs.lock().iter().map(|job| job.admission.place()).collect()
        }
    }

    impl Spawn for FlakySpawner {
        fn spawn(&self, job: WorkerJob) -> core::result::Result<(), SpawnError> {
            let remaining = self.failures.load(Ordering::Acquire);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Release);
                return Err(SpawnError {
                    job,
                    reason: "no capacity".to_string(),
                });
            }
            self.jobs.lock().push(job);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        inbound: FifoGuard,
        controller: Arc<AdmissionController>,
        token: CancellationToken,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new(workers: Limit, places: Limit) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let inbound = create_fifo(&dir.path().join("inbound")).unwrap();
            Self {
                _dir: dir,
                inbound,
                controller: Arc::new(AdmissionController::new(workers, places)),
                token: CancellationToken::new(),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn listener(&self, spawner: Arc<dyn Spawn>) -> Listener {
            self.listener_draining_for(spawner, Duration::from_millis(20))
        }

        fn listener_draining_for(&self, spawner: Arc<dyn Spawn>, drain_idle: Duration) -> Listener {
            Listener::new(
                open_inbound_receiver(self.inbound.path()).unwrap(),
                Arc::clone(&self.controller),
                ShutdownSignal::new(self.token.clone()),
                self.sink.clone(),
                spawner,
                ListenerTiming {
                    eof_backoff: Duration::from_millis(5),
                    drain_idle,
                    spawn_retry: Duration::from_millis(1),
                },
            )
        }

        async fn send(&self, frames: &[Frame]) {
            let mut sender = open_inbound_sender(self.inbound.path()).unwrap();
            for frame in frames {
                write_frame(&mut sender, frame, self.inbound.path(), PeerRole::Server)
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn second_spawn_failure_is_fatal_and_releases() {
        let fx = Fixture::new(Limit::Bounded(2), Limit::Bounded(2));
        let spawner = FlakySpawner::failing(2);
        let listener = tokio::spawn(fx.listener(spawner.clone()).run());

        fx.send(&[Request::new(1, 10, 1, 5).encode()]).await;

        let err = listener.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(spawner.jobs.lock().is_empty());
        assert_eq!(fx.controller.available_worker_slots(), Some(2));
        assert_eq!(fx.controller.available_resource_slots(), Some(2));
        assert_eq!(fx.controller.occupied_slots(), Some(0));
    }

    #[tokio::test]
    async fn single_spawn_failure_is_retried() {
        let fx = Fixture::new(Limit::Bounded(2), Limit::Bounded(2));
        let spawner = FlakySpawner::failing(1);
        let listener = tokio::spawn(fx.listener(spawner.clone()).run());

        fx.send(&[Request::new(1, 10, 1, 5).encode()]).await;
        sleep(Duration::from_millis(50)).await;
        fx.token.cancel();

        listener.await.unwrap().unwrap();
        assert_eq!(spawner.places(), vec![1]);
        assert_eq!(fx.sink.count(Lifecycle::Received), 1);
    }

    #[tokio::test]
    async fn invalid_frames_are_skipped() {
        let fx = Fixture::new(Limit::Bounded(2), Limit::Bounded(2));
        let spawner = FlakySpawner::failing(0);
        let listener = tokio::spawn(fx.listener(spawner.clone()).run());

        fx.send(&[
            Request::new(1, 0, 1, 5).encode(),
            Request::new(2, 10, 2, 5).encode(),
        ])
        .await;
        sleep(Duration::from_millis(50)).await;
        fx.token.cancel();

        listener.await.unwrap().unwrap();
        let jobs = spawner.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request.id, 2);
    }

    #[tokio::test]
    async fn unlimited_resource_numbers_requests() {
        let fx = Fixture::new(Limit::Unlimited, Limit::Unlimited);
        let spawner = FlakySpawner::failing(0);
        let listener = tokio::spawn(fx.listener(spawner.clone()).run());

        let frames: Vec<_> = (1..=3).map(|id| Request::new(id, 10, 7, 5).encode()).collect();
        fx.send(&frames).await;
        sleep(Duration::from_millis(50)).await;
        fx.token.cancel();

        listener.await.unwrap().unwrap();
        assert_eq!(spawner.places(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn idle_channel_ends_after_shutdown() {
        let fx = Fixture::new(Limit::Bounded(1), Limit::Bounded(1));
        let spawner = FlakySpawner::failing(0);
        let listener = tokio::spawn(fx.listener(spawner.clone()).run());

        sleep(Duration::from_millis(20)).await;
        fx.token.cancel();

        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fx.controller.available_worker_slots(), Some(1));
        assert_eq!(fx.controller.occupied_slots(), Some(0));
    }

    #[tokio::test]
    async fn requests_read_after_shutdown_hold_no_place() {
        let fx = Fixture::new(Limit::Bounded(2), Limit::Bounded(1));
        let spawner = FlakySpawner::failing(0);

        let listener = fx.listener(spawner.clone());
        let mut sender = open_inbound_sender(fx.inbound.path()).unwrap();
        fx.token.cancel();
        write_frame(
            &mut sender,
            &Request::new(9, 10, 9, 5).encode(),
            fx.inbound.path(),
            PeerRole::Server,
        )
        .await
        .unwrap();
        drop(sender);

        listener.run().await.unwrap();
        assert_eq!(spawner.places(), vec![-1]);
        assert_eq!(fx.controller.occupied_slots(), Some(0));
    }

    #[tokio::test]
    async fn frame_split_by_shutdown_is_still_read() {
        let fx = Fixture::new(Limit::Bounded(2), Limit::Bounded(1));
        let spawner = FlakySpawner::failing(0);
        let listener = fx.listener_draining_for(spawner.clone(), Duration::from_millis(500));
        let listener = tokio::spawn(listener.run());

        let frame = Request::new(9, 10, 9, 5).encode();
        let mut sender = open_inbound_sender(fx.inbound.path()).unwrap();
        sender.write_all(&frame[..5]).await.unwrap();
        sleep(Duration::from_millis(30)).await;

        // Interrupts the read that already holds the first five bytes.
        fx.token.cancel();
        sleep(Duration::from_millis(10)).await;
        sender.write_all(&frame[5..]).await.unwrap();
        drop(sender);

        listener.await.unwrap().unwrap();
        let jobs = spawner.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request, Request::decode(&frame).unwrap());
        assert_eq!(jobs[0].admission.place(), -1);
        assert_eq!(fx.controller.occupied_slots(), Some(0));
    }
}
