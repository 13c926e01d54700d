//! Run-duration timer and the process-wide shutdown flag.
//!
//! The flag is a [`CancellationToken`] owned by the [`ShutdownCoordinator`].
//! Everyone else sees it through a cloneable [`ShutdownSignal`], which can
//! only read it and wrap blocking waits so that a wait in flight when the
//! token fires returns [`Error::Interrupted`].
//!
//! A wait that *starts* after shutdown is not interrupted: the listener keeps
//! reading buffered requests in drain mode and must be able to block on its
//! pools while doing so.

use core::future::Future;
use portable_atomic::{AtomicBool, Ordering};
use stallkeeper_core::{Error, Result, fifo::FifoGuard};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

/// Read-only view of the shutdown flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub const fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A signal that never fires.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    /// `true` until shutdown has been triggered.
    pub fn is_accepting(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Runs `fut`, aborting it if shutdown fires before it completes.
    ///
    /// If shutdown has already fired when this is called, `fut` runs to
    /// completion. When `fut` and shutdown are ready at the same time the
    /// result of `fut` wins, so a slot that was obtained is never dropped on
    /// the floor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if shutdown fired during the wait.
    /// `fut` is dropped in that case and must be cancel-safe.
    pub async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output> {
        if self.token.is_cancelled() {
            return Ok(fut.await);
        }

        tokio::select! {
            biased;
            out = fut => Ok(out),
            () = self.token.cancelled() => Err(Error::Interrupted),
        }
    }
}

/// Sole writer of the shutdown flag.
///
/// [`trigger`](Self::trigger) flips the flag and unlinks the inbound channel
/// so that no new client can connect. It takes effect at most once no matter
/// how many times, or from where, it is called.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    inbound: Arc<FifoGuard>,
    fired: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(inbound: Arc<FifoGuard>) -> Self {
        Self {
            token: CancellationToken::new(),
            inbound,
            fired: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.token.clone())
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Stops admissions and removes the inbound channel.
    ///
    /// Returns `false` if shutdown had already been triggered.
    pub fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        tracing::info!("Closing: no further requests will be admitted");
        self.token.cancel();

        if let Err(e) = self.inbound.remove() {
            tracing::error!("Error on unlinking inbound channel: {e}");
        }

        true
    }

    /// Starts the one-shot run-duration timer.
    ///
    /// The timer task ends early, without doing anything, if shutdown is
    /// triggered by other means first.
    pub fn arm(self: &Arc<Self>, run_for: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(run_for) => {
                    tracing::debug!("Run time of {run_for:?} elapsed");
                    this.trigger();
                }
                () = this.token.cancelled() => {}
            }
        })
    }
}
