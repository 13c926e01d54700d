//! Client side of a single request/reply exchange.
//!
//! A client must own its private reply channel before the server could
//! possibly answer, so the order of operations is fixed:
//!
//! 1. create `<reply_dir>/<pid>.<tid>` and open it for reading;
//! 2. open the inbound channel and write the request;
//! 3. wait for exactly one reply frame;
//! 4. remove the private channel (on every path, via [`FifoGuard`]).
//!
//! [`FifoGuard`]: crate::fifo::FifoGuard

use crate::{
    Error, Result,
    fifo::{
        PeerRole, ReadOutcome, create_fifo, open_inbound_sender, open_private_receiver,
        read_frame, write_frame,
    },
    naming::reply_channel_path,
    protocol::{Reply, Request},
};
use std::{path::Path, time::Duration};
use tokio::time::{Instant, timeout_at};

/// Sends `request` to the server listening on `inbound` and waits up to
/// `reply_timeout` for its reply.
///
/// # Errors
///
/// - [`Error::ServerClosed`] if the inbound channel is gone or unread.
/// - [`Error::ReplyTimeout`] if no reply arrives in time.
/// - [`Error::Io`] / [`Error::InvalidMessage`] on channel failures.
pub async fn request_access(
    inbound: &Path,
    reply_dir: &Path,
    request: Request,
    reply_timeout: Duration,
) -> Result<Reply> {
    let reply_path = reply_channel_path(reply_dir, request.client_pid, request.client_tid);
    let _reply_fifo = create_fifo(&reply_path)?;
    let mut receiver = open_private_receiver(&reply_path)?;

    {
        let mut sender = open_inbound_sender(inbound)?;
        write_frame(&mut sender, &request.encode(), inbound, PeerRole::Server).await?;
    }

    let deadline = Instant::now() + reply_timeout;
    loop {
        match timeout_at(deadline, read_frame(&mut receiver)).await {
            Ok(Ok(ReadOutcome::Frame(frame))) => return Ok(Reply::decode(&frame)),
            // Only reachable where the channel could not be opened
            // read-write; the server has not connected yet.
            Ok(Ok(ReadOutcome::Eof)) => tokio::task::yield_now().await,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ReplyTimeout),
        }
    }
}
