//! # Request/Reply Wire Format
//!
//! Every message exchanged with the server, in both directions, is the same
//! fixed-size record written to a FIFO in a single `write`. Records are far
//! smaller than `PIPE_BUF`, so concurrent writers on the inbound FIFO never
//! interleave.
//!
//! ## Layout
//!
//! All fields are little-endian with no padding:
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 4    | `id`    |
//! | 4      | 4    | `pid`   |
//! | 8      | 8    | `tid`   |
//! | 16     | 4    | `dur`   |
//! | 20     | 4    | `place` |
//!
//! `dur` is in milliseconds. A request always carries `place = -1`. A reply
//! echoes `id`, `pid` and `tid`; a rejected reply carries `dur = -1` and
//! `place = -1`.

use crate::Error;

/// Size in bytes of one encoded record.
pub const MESSAGE_SIZE: usize = 24;

/// Value of `place` (and of `dur` in a rejection) meaning "not assigned".
pub const UNASSIGNED: i32 = -1;

/// One encoded record.
pub type Frame = [u8; MESSAGE_SIZE];

const ID: usize = 0;
const PID: usize = 4;
const TID: usize = 8;
const DUR: usize = 16;
const PLACE: usize = 20;

const _: () = assert!(PLACE + 4 == MESSAGE_SIZE, "record layout must be dense");

/// A client's request for a place, as read from the inbound channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    /// Client-chosen request identifier.
    pub id: i32,
    /// Process id of the client; half of the reply channel name.
    pub client_pid: i32,
    /// Thread (or task) id of the client; the other half.
    pub client_tid: u64,
    /// Requested occupancy in milliseconds. Non-positive means too late.
    pub duration_ms: i32,
}

/// The server's answer to a [`Request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub id: i32,
    pub client_pid: i32,
    pub client_tid: u64,
    /// Granted occupancy in milliseconds; non-positive when rejected.
    pub granted_ms: i32,
    /// One-based place (slot index + 1 or sequence number + 1), or
    /// [`UNASSIGNED`].
    pub place: i32,
}

impl Request {
    pub const fn new(id: i32, client_pid: i32, client_tid: u64, duration_ms: i32) -> Self {
        Self {
            id,
            client_pid,
            client_tid,
            duration_ms,
        }
    }

    pub fn encode(&self) -> Frame {
        encode_fields(
            self.id,
            self.client_pid,
            self.client_tid,
            self.duration_ms,
            UNASSIGNED,
        )
    }

    /// Decodes a request frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the client pid is not positive,
    /// since no reply channel could be named for it.
    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        let client_pid = read_i32(frame, PID);
        if client_pid <= 0 {
            return Err(Error::InvalidMessage {
                reason: format!("client pid {client_pid} is not positive"),
            });
        }

        Ok(Self {
            id: read_i32(frame, ID),
            client_pid,
            client_tid: read_u64(frame, TID),
            duration_ms: read_i32(frame, DUR),
        })
    }
}

impl Reply {
    /// An admitting reply: grants the requested duration at `place`.
    pub const fn granted(request: &Request, place: i32) -> Self {
        Self {
            id: request.id,
            client_pid: request.client_pid,
            client_tid: request.client_tid,
            granted_ms: request.duration_ms,
            place,
        }
    }

    /// A rejecting reply, sent once the server has stopped accepting.
    pub const fn rejected(request: &Request) -> Self {
        Self {
            id: request.id,
            client_pid: request.client_pid,
            client_tid: request.client_tid,
            granted_ms: UNASSIGNED,
            place: UNASSIGNED,
        }
    }

    /// Whether the client may occupy a place.
    pub const fn is_granted(&self) -> bool {
        self.granted_ms > 0
    }

    pub fn encode(&self) -> Frame {
        encode_fields(
            self.id,
            self.client_pid,
            self.client_tid,
            self.granted_ms,
            self.place,
        )
    }

    pub fn decode(frame: &Frame) -> Self {
        Self {
            id: read_i32(frame, ID),
            client_pid: read_i32(frame, PID),
            client_tid: read_u64(frame, TID),
            granted_ms: read_i32(frame, DUR),
            place: read_i32(frame, PLACE),
        }
    }
}

fn encode_fields(id: i32, pid: i32, tid: u64, dur: i32, place: i32) -> Frame {
    let mut frame = [0_u8; MESSAGE_SIZE];
    frame[ID..PID].copy_from_slice(&id.to_le_bytes());
    frame[PID..TID].copy_from_slice(&pid.to_le_bytes());
    frame[TID..DUR].copy_from_slice(&tid.to_le_bytes());
    frame[DUR..PLACE].copy_from_slice(&dur.to_le_bytes());
    frame[PLACE..].copy_from_slice(&place.to_le_bytes());
    frame
}

fn read_i32(frame: &Frame, offset: usize) -> i32 {
    i32::from_le_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

fn read_u64(frame: &Frame, offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&frame[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
