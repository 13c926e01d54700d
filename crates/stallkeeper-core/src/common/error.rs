//! Error types for the stallkeeper admission server and its clients.
//!
//! This module defines the central `Error` enum. The variants mirror the
//! failure taxonomy of the server: some are expected and never logged as
//! errors (shutdown interruption, client churn), some are contained to a
//! single request (invariant violations, malformed frames), and only inbound
//! channel I/O failures and persistent spawn failures are fatal.
//!
//! ## Error Cases
//! - `Interrupted`: A blocking wait was aborted because shutdown fired.
//! - `ClientGone`: The client's private reply FIFO is missing or broken.
//! - `ServerClosed`: The inbound FIFO is missing or has no reader.
//! - `InvalidMessage`: A frame was short or failed validation.
//! - `SlotTableExhausted`: A resource permit was granted with no open slot.
//! - `PoolClosed`: An admission pool was closed while waiting on it.
//! - `Spawn`: A worker could not be started.
//! - `ReplyTimeout`: A client gave up waiting for its reply.
//! - `Io`: Any other I/O failure.

use std::path::PathBuf;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the admission server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A blocking call was aborted by the shutdown signal.
    #[error("Interrupted by shutdown")]
    Interrupted,

    /// The client's private reply channel does not exist, has no reader, or
    /// was closed while the reply was being written.
    #[error("Client gave up on reply channel {}", path.display())]
    ClientGone { path: PathBuf },

    /// The inbound channel is gone or nobody is reading it.
    #[error("Server is not accepting requests on {}", path.display())]
    ServerClosed { path: PathBuf },

    /// A frame could not be decoded into a valid message.
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// The resource semaphore admitted a caller but every slot is in use.
    #[error("No open slot despite admission (capacity = {capacity})")]
    SlotTableExhausted { capacity: usize },

    /// An admission pool was closed.
    #[error("Admission pool closed")]
    PoolClosed,

    /// A worker could not be started.
    #[error("Failed to spawn worker: {reason}")]
    Spawn { reason: String },

    /// No reply arrived before the client's deadline.
    #[error("Timed out waiting for reply")]
    ReplyTimeout,

    /// Any other I/O failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` if this error only signals that shutdown interrupted a
    /// blocking call.
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Returns `true` if this error is expected client churn rather than a
    /// server fault.
    pub const fn is_client_gone(&self) -> bool {
        matches!(self, Self::ClientGone { .. })
    }
}
