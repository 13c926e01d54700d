use super::slots::SlotTable;
use crate::server::{config::Limit, shutdown::ShutdownSignal};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use stallkeeper_core::{Error, Result, protocol::UNASSIGNED};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Gate in front of request processing: one counting pool for concurrent
/// workers, one for concurrent occupants of the resource.
///
/// Every acquire returns an owned lease that gives its capacity back when it
/// is released or dropped. An unlimited pool hands out empty leases without
/// waiting.
#[derive(Debug)]
pub struct AdmissionController {
    workers: Option<Arc<Semaphore>>,
    resources: Option<ResourcePool>,
    sequence: AtomicU64,
}

#[derive(Debug)]
struct ResourcePool {
    permits: Arc<Semaphore>,
    table: Arc<Mutex<SlotTable>>,
}

impl AdmissionController {
    pub fn new(worker_limit: Limit, resource_limit: Limit) -> Self {
        Self {
            workers: worker_limit
                .bounded()
                .map(|n| Arc::new(Semaphore::new(n))),
            resources: resource_limit.bounded().map(|n| ResourcePool {
                permits: Arc::new(Semaphore::new(n)),
                table: Arc::new(Mutex::new(SlotTable::new(n))),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    pub const fn is_worker_bounded(&self) -> bool {
        self.workers.is_some()
    }

    pub const fn is_resource_bounded(&self) -> bool {
        self.resources.is_some()
    }

    /// Waits for a worker slot.
    ///
    /// # Errors
    ///
    /// - [`Error::Interrupted`] if shutdown fired during the wait; no slot is
    ///   held in that case.
    /// - [`Error::PoolClosed`] if the pool was closed.
    pub async fn acquire_worker_slot(&self, shutdown: &ShutdownSignal) -> Result<WorkerSlot> {
        let Some(workers) = &self.workers else {
            return Ok(WorkerSlot { permit: None });
        };

        let permit = shutdown
            .interruptible(Arc::clone(workers).acquire_owned())
            .await?
            .map_err(|_| Error::PoolClosed)?;

        Ok(WorkerSlot {
            permit: Some(permit),
        })
    }

    /// Waits for a resource permit and claims the lowest open place.
    ///
    /// With an unlimited resource this returns [`ResourceHold::Unassigned`]
    /// immediately; a sequence number is attached later with
    /// [`next_sequence`](Self::next_sequence).
    ///
    /// # Errors
    ///
    /// - [`Error::Interrupted`] if shutdown fired during the wait.
    /// - [`Error::SlotTableExhausted`] if a permit was granted but no place
    ///   was open. The permit is returned before the error is reported.
    /// - [`Error::PoolClosed`] if the pool was closed.
    pub async fn acquire_resource_slot(&self, shutdown: &ShutdownSignal) -> Result<ResourceHold> {
        let Some(pool) = &self.resources else {
            return Ok(ResourceHold::Unassigned);
        };

        let permit = shutdown
            .interruptible(Arc::clone(&pool.permits).acquire_owned())
            .await?
            .map_err(|_| Error::PoolClosed)?;

        let mut table = pool.table.lock();
        let Some(index) = table.assign() else {
            let capacity = table.capacity();
            drop(table);
            drop(permit);
            return Err(Error::SlotTableExhausted { capacity });
        };
        drop(table);

        Ok(ResourceHold::Slot(ResourceSlot {
            index,
            table: Arc::clone(&pool.table),
            permit: Some(permit),
        }))
    }

    /// Next number of the running sequence used when the resource is
    /// unlimited. Strictly increasing, starting at zero.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Free worker slots, or `None` if the pool is unlimited.
    pub fn available_worker_slots(&self) -> Option<usize> {
        self.workers.as_ref().map(|s| s.available_permits())
    }

    /// Free resource permits, or `None` if the pool is unlimited.
    pub fn available_resource_slots(&self) -> Option<usize> {
        self.resources
            .as_ref()
            .map(|pool| pool.permits.available_permits())
    }

    /// Places currently marked used, or `None` if the pool is unlimited.
    pub fn occupied_slots(&self) -> Option<usize> {
        self.resources
            .as_ref()
            .map(|pool| pool.table.lock().occupied())
    }

    /// Closes both pools; pending and future acquires fail with
    /// [`Error::PoolClosed`]. Leases already handed out stay valid.
    pub fn close(&self) {
        if let Some(workers) = &self.workers {
            workers.close();
        }
        if let Some(pool) = &self.resources {
            pool.permits.close();
        }
    }
}

/// Lease on one worker slot. Empty when the pool is unlimited.
#[derive(Debug)]
pub struct WorkerSlot {
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerSlot {
    pub const fn is_bounded(&self) -> bool {
        self.permit.is_some()
    }

    pub fn release(self) {
        drop(self);
    }
}

/// Lease on one place of the bounded resource.
///
/// Dropping it reopens the place before returning the permit, so whoever
/// obtains the permit next always finds an open place.
#[derive(Debug)]
pub struct ResourceSlot {
    index: usize,
    table: Arc<Mutex<SlotTable>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ResourceSlot {
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ResourceSlot {
    fn drop(&mut self) {
        self.table.lock().free(self.index);
        drop(self.permit.take());
    }
}

/// What a request holds of the resource pool.
#[derive(Debug)]
pub enum ResourceHold {
    /// A concrete place of the bounded resource.
    Slot(ResourceSlot),
    /// A running sequence number (unlimited resource).
    Sequence(u64),
    /// Nothing: unlimited resource before numbering, or a request read after
    /// shutdown.
    Unassigned,
}

impl ResourceHold {
    /// One-based place reported to the client, or [`UNASSIGNED`].
    pub fn place(&self) -> i32 {
        match self {
            Self::Slot(slot) => i32::try_from(slot.index + 1).unwrap_or(i32::MAX),
            Self::Sequence(n) => i32::try_from(n.saturating_add(1)).unwrap_or(i32::MAX),
            Self::Unassigned => UNASSIGNED,
        }
    }
}

/// Everything a request holds from the controller.
///
/// Fields drop in declaration order, so the resource hold is always released
/// before the worker slot, mirroring the acquire order.
#[derive(Debug)]
pub struct Admission {
    resource: ResourceHold,
    worker: WorkerSlot,
}

impl Admission {
    pub const fn new(worker: WorkerSlot, resource: ResourceHold) -> Self {
        Self { resource, worker }
    }

    pub const fn resource(&self) -> &ResourceHold {
        &self.resource
    }

    /// Attaches a sequence number if nothing is held yet.
    pub fn number(&mut self, sequence: u64) {
        if matches!(self.resource, ResourceHold::Unassigned) {
            self.resource = ResourceHold::Sequence(sequence);
        }
    }

    pub fn place(&self) -> i32 {
        self.resource.place()
    }

    /// Releases the resource hold, then the worker slot.
    pub fn release(self) {
        let Self { resource, worker } = self;
        drop(resource);
        worker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::shutdown::ShutdownSignal;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    fn bounded(workers: usize, places: usize) -> AdmissionController {
        AdmissionController::new(Limit::Bounded(workers), Limit::Bounded(places))
    }

    #[tokio::test]
    async fn unlimited_pools_never_block() {
        let controller = AdmissionController::new(Limit::Unlimited, Limit::Unlimited);
        let shutdown = ShutdownSignal::detached();

        let mut held = Vec::new();
        for _ in 0..1000 {
            let worker = controller.acquire_worker_slot(&shutdown).await.unwrap();
            let resource = controller.acquire_resource_slot(&shutdown).await.unwrap();
            assert!(matches!(resource, ResourceHold::Unassigned));
            held.push(Admission::new(worker, resource));
        }

        assert_eq!(controller.available_worker_slots(), None);
        assert_eq!(controller.occupied_slots(), None);
    }

    #[test]
    fn sequence_is_strictly_increasing() {
        let controller = AdmissionController::new(Limit::Unlimited, Limit::Unlimited);
        let numbers: Vec<_> = (0..5).map(|_| controller.next_sequence()).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);

        let mut admission = Admission::new(WorkerSlot { permit: None }, ResourceHold::Unassigned);
        admission.number(41);
        assert_eq!(admission.place(), 42);
    }

    #[tokio::test]
    async fn bounded_resource_assigns_distinct_places() {
        let controller = bounded(4, 2);
        let shutdown = ShutdownSignal::detached();

        let a = controller.acquire_resource_slot(&shutdown).await.unwrap();
        let b = controller.acquire_resource_slot(&shutdown).await.unwrap();
        assert_eq!(a.place(), 1);
        assert_eq!(b.place(), 2);
        assert_eq!(controller.occupied_slots(), Some(2));
        assert_eq!(controller.available_resource_slots(), Some(0));

        drop(a);
        assert_eq!(controller.occupied_slots(), Some(1));
        let c = controller.acquire_resource_slot(&shutdown).await.unwrap();
        assert_eq!(c.place(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity() {
        let controller = bounded(1, 1);
        let shutdown = ShutdownSignal::detached();

        let _held = controller.acquire_worker_slot(&shutdown).await.unwrap();
        let blocked = timeout(
            Duration::from_millis(20),
            controller.acquire_worker_slot(&shutdown),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn interrupted_wait_holds_nothing() {
        let controller = Arc::new(bounded(1, 1));
        let token = CancellationToken::new();
        let shutdown = ShutdownSignal::new(token.clone());
        let worker = controller.acquire_worker_slot(&shutdown).await.unwrap();
        let resource = controller.acquire_resource_slot(&shutdown).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.acquire_resource_slot(&shutdown).await })
        };
        sleep(Duration::from_millis(10)).await;
        token.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_interrupted());

        Admission::new(worker, resource).release();
        assert_eq!(controller.available_worker_slots(), Some(1));
        assert_eq!(controller.available_resource_slots(), Some(1));
        assert_eq!(controller.occupied_slots(), Some(0));
    }

    #[tokio::test]
    async fn waits_started_after_shutdown_are_not_interrupted() {
        let controller = bounded(1, 1);
        let token = CancellationToken::new();
        let shutdown = ShutdownSignal::new(token.clone());
        token.cancel();

        let slot = controller.acquire_worker_slot(&shutdown).await;
        assert!(slot.is_ok());
    }

    #[tokio::test]
    async fn exhausted_table_returns_permit() {
        let controller = bounded(2, 1);
        let shutdown = ShutdownSignal::detached();

        // Occupy the only place without taking a permit.
        let table = Arc::clone(&controller.resources.as_ref().unwrap().table);
        assert_eq!(table.lock().assign(), Some(0));

        let err = controller.acquire_resource_slot(&shutdown).await.unwrap_err();
        assert!(matches!(err, Error::SlotTableExhausted { capacity: 1 }));
        assert_eq!(controller.available_resource_slots(), Some(1));

        table.lock().free(0);
        assert!(controller.acquire_resource_slot(&shutdown).await.is_ok());
    }

    #[tokio::test]
    async fn release_mirrors_acquire_under_contention() {
        let controller = Arc::new(bounded(3, 2));
        let shutdown = ShutdownSignal::detached();

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let controller = Arc::clone(&controller);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let worker = controller.acquire_worker_slot(&shutdown).await.unwrap();
                let resource = controller.acquire_resource_slot(&shutdown).await.unwrap();
                let occupied = controller.occupied_slots().unwrap();
                assert!(occupied <= 2);
                sleep(Duration::from_millis(2)).await;
                Admission::new(worker, resource).release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(controller.available_worker_slots(), Some(3));
        assert_eq!(controller.available_resource_slots(), Some(2));
        assert_eq!(controller.occupied_slots(), Some(0));
    }

    #[tokio::test]
    async fn closed_pool_reports_closed() {
        let controller = bounded(1, 1);
        controller.close();
        let err = controller
            .acquire_worker_slot(&ShutdownSignal::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }
}
