use crate::server::{
    admission::Admission,
    events::{EventSink, Lifecycle, emit},
    shutdown::ShutdownSignal,
    telemetry::{decrement_workers_inflight, increment_workers_inflight},
};
use stallkeeper_core::{
    Result,
    fifo::{PeerRole, open_reply_sender, write_frame},
    naming::reply_channel_path,
    protocol::{Reply, Request},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time::sleep;

/// One request read by the listener together with everything it was
/// admitted with.
#[derive(Debug)]
pub struct WorkerJob {
    pub request: Request,
    pub admission: Admission,
}

impl WorkerJob {
    pub const fn new(request: Request, admission: Admission) -> Self {
        Self { request, admission }
    }
}

/// State shared by every worker.
pub struct WorkerContext {
    pub shutdown: ShutdownSignal,
    pub events: Arc<dyn EventSink>,
    /// Directory holding the clients' private reply channels.
    pub reply_dir: PathBuf,
}

/// Serves one request from reply to release.
///
/// The reply grants the requested duration if the server is still accepting
/// when the worker runs, and is a rejection otherwise. A client that is gone
/// is reported as [`Lifecycle::GaveUp`]; any other delivery failure is only
/// logged. Either way the occupancy period of a granted reply is honored in
/// full, even across shutdown, and the admission is released last.
pub async fn run(job: WorkerJob, ctx: Arc<WorkerContext>) {
    let _inflight = Inflight::enter();
    let WorkerJob { request, admission } = job;

    let reply = if ctx.shutdown.is_accepting() {
        Reply::granted(&request, admission.place())
    } else {
        Reply::rejected(&request)
    };

    let path = reply_channel_path(&ctx.reply_dir, reply.client_pid, reply.client_tid);
    match deliver(&path, &reply).await {
        Ok(()) => {}
        Err(e) if e.is_client_gone() => emit(ctx.events.as_ref(), Lifecycle::GaveUp, &reply),
        Err(e) => tracing::error!("Couldn't reply to request {}: {e}", reply.id),
    }

    if reply.is_granted() {
        emit(ctx.events.as_ref(), Lifecycle::Entered, &reply);
        sleep(Duration::from_millis(u64::from(reply.granted_ms.unsigned_abs()))).await;
        emit(ctx.events.as_ref(), Lifecycle::TimedUp, &reply);
    } else {
        emit(ctx.events.as_ref(), Lifecycle::TooLate, &reply);
    }

    admission.release();
}

/// Opens the reply channel, writes the reply and closes the channel.
async fn deliver(path: &Path, reply: &Reply) -> Result<()> {
    let mut sender = open_reply_sender(path)?;
    write_frame(&mut sender, &reply.encode(), path, PeerRole::Client).await
}

/// Keeps `workers_inflight` accurate even if a worker unwinds.
struct Inflight;

impl Inflight {
    fn enter() -> Self {
        increment_workers_inflight();
        Self
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        decrement_workers_inflight();
    }
}
