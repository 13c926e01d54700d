//! Named FIFO plumbing.
//!
//! Thin wrappers around `mkfifo(3)` and [`tokio::net::unix::pipe`] that
//! translate the errno values the protocol cares about into [`Error`]
//! variants:
//!
//! - `ENOENT` / `ENXIO` on open and `EPIPE` on write mean the peer is gone.
//!   For a reply channel that is [`Error::ClientGone`]; for the inbound
//!   channel it is [`Error::ServerClosed`].
//! - Everything else is [`Error::Io`].
//!
//! A FIFO's filesystem entry is owned by a [`FifoGuard`], which unlinks it
//! at most once, either explicitly or on drop.

use crate::{
    Error, Result,
    protocol::{Frame, MESSAGE_SIZE},
};
use nix::{errno::Errno, sys::stat::Mode, unistd::mkfifo};
use portable_atomic::{AtomicBool, Ordering};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
};

/// Permission bits of every FIFO created here (before umask).
pub const FIFO_MODE: u32 = 0o660;

/// Owner of a FIFO's filesystem entry.
#[derive(Debug)]
pub struct FifoGuard {
    path: PathBuf,
    removed: AtomicBool,
}

impl FifoGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`remove`](Self::remove) has already run.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Unlinks the FIFO. Only the first call touches the filesystem.
    ///
    /// Returns `Ok(true)` if this call removed the entry, `Ok(false)` if it
    /// was already removed (by this guard or by someone else).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the unlink fails for a reason other than the
    /// entry being absent.
    pub fn remove(&self) -> Result<bool> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(
                format!("couldn't unlink FIFO {}", self.path.display()),
                e,
            )),
        }
    }
}

impl Drop for FifoGuard {
    fn drop(&mut self) {
        if !self.is_removed() {
            let _ = self.remove();
        }
    }
}

/// Creates a FIFO at `path` with [`FIFO_MODE`].
///
/// # Errors
///
/// Returns [`Error::Io`] if the FIFO cannot be created, including when the
/// path already exists.
pub fn create_fifo(path: &Path) -> Result<FifoGuard> {
    mkfifo(path, Mode::from_bits_truncate(FIFO_MODE as _)).map_err(|errno| {
        Error::io(
            format!("couldn't create FIFO {}", path.display()),
            io::Error::from(errno),
        )
    })?;

    Ok(FifoGuard {
        path: path.to_path_buf(),
        removed: AtomicBool::new(false),
    })
}

/// Whether an open/write error means the other end of the FIFO is gone.
pub fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe
    ) || err.raw_os_error() == Some(Errno::ENXIO as i32)
}

/// Opens the server's end of the inbound channel.
///
/// The receiver is non-blocking and sees end-of-input whenever no client has
/// the channel open for writing.
///
/// # Errors
///
/// Returns [`Error::Io`] on any failure.
pub fn open_inbound_receiver(path: &Path) -> Result<pipe::Receiver> {
    pipe::OpenOptions::new()
        .open_receiver(path)
        .map_err(|e| Error::io(format!("couldn't open inbound FIFO {}", path.display()), e))
}

/// Opens a client's own reply channel for reading.
///
/// On Linux the channel is opened read-write so reads wait for the reply
/// instead of reporting end-of-input before the server connects.
///
/// # Errors
///
/// Returns [`Error::Io`] on any failure.
pub fn open_private_receiver(path: &Path) -> Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options
        .open_receiver(path)
        .map_err(|e| Error::io(format!("couldn't open reply FIFO {}", path.display()), e))
}

/// Opens a client's reply channel for writing.
///
/// # Errors
///
/// Returns [`Error::ClientGone`] if the channel does not exist or has no
/// reader, and [`Error::Io`] otherwise.
pub fn open_reply_sender(path: &Path) -> Result<pipe::Sender> {
    pipe::OpenOptions::new()
        .open_sender(path)
        .map_err(|e| gone_or_io(e, path, PeerRole::Client))
}

/// Opens the server's inbound channel for writing.
///
/// # Errors
///
/// Returns [`Error::ServerClosed`] if the channel does not exist or has no
/// reader, and [`Error::Io`] otherwise.
pub fn open_inbound_sender(path: &Path) -> Result<pipe::Sender> {
    pipe::OpenOptions::new()
        .open_sender(path)
        .map_err(|e| gone_or_io(e, path, PeerRole::Server))
}

/// Writes one frame. A broken pipe is reported the same way as a missing
/// peer on open.
///
/// # Errors
///
/// Returns [`Error::ClientGone`] / [`Error::ServerClosed`] (depending on
/// `peer`) for a broken pipe, and [`Error::Io`] otherwise.
pub async fn write_frame(
    sender: &mut pipe::Sender,
    frame: &Frame,
    path: &Path,
    peer: PeerRole,
) -> Result<()> {
    sender
        .write_all(frame)
        .await
        .map_err(|e| gone_or_io(e, path, peer))
}

/// Which side of the protocol sits at the other end of a FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    Server,
}

/// Result of reading one record.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// Zero-length read: no writer currently has the FIFO open.
    Eof,
}

/// Reads exactly one record.
///
/// Bytes of a partial record are lost if the returned future is dropped.
/// Use a [`FrameReader`] where the read races other branches.
///
/// # Errors
///
/// Returns [`Error::InvalidMessage`] if the writer went away mid-record and
/// [`Error::Io`] for any other read failure.
pub async fn read_frame(receiver: &mut pipe::Receiver) -> Result<ReadOutcome> {
    FrameReader::new().read(receiver).await
}

/// Record reader that keeps a partially received record between calls.
///
/// [`read`](Self::read) is cancel-safe: when its future is dropped, bytes
/// already taken from the pipe stay buffered and the next call completes the
/// same record.
#[derive(Debug)]
pub struct FrameReader {
    buf: Frame,
    filled: usize,
}

impl FrameReader {
    pub const fn new() -> Self {
        Self {
            buf: [0_u8; MESSAGE_SIZE],
            filled: 0,
        }
    }

    /// Number of bytes of the next record already received.
    pub const fn pending(&self) -> usize {
        self.filled
    }

    /// Reads until one full record is buffered.
    ///
    /// Returns [`ReadOutcome::Eof`] only on a record boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the writer went away mid-record,
    /// discarding the partial bytes, and [`Error::Io`] for any other read
    /// failure.
    pub async fn read(&mut self, receiver: &mut pipe::Receiver) -> Result<ReadOutcome> {
        loop {
            let read = receiver
                .read(&mut self.buf[self.filled..])
                .await
                .map_err(|e| Error::io("couldn't read FIFO", e))?;

            if read == 0 {
                let short = core::mem::take(&mut self.filled);
                if short == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(Error::InvalidMessage {
                    reason: format!("short frame of {short} bytes"),
                });
            }

            self.filled += read;
            if self.filled == MESSAGE_SIZE {
                self.filled = 0;
                return Ok(ReadOutcome::Frame(self.buf));
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

fn gone_or_io(err: io::Error, path: &Path, peer: PeerRole) -> Error {
    if !is_peer_gone(&err) {
        return Error::io(format!("couldn't use FIFO {}", path.display()), err);
    }

    let path = path.to_path_buf();
    match peer {
        PeerRole::Client => Error::ClientGone { path },
        PeerRole::Server => Error::ServerClosed { path },
    }
}
