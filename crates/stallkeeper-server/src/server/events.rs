//! Lifecycle events.
//!
//! The server reports one event per lifecycle transition of a request:
//!
//! | event      | tag     | emitted when                                  |
//! |------------|---------|-----------------------------------------------|
//! | `Received` | `RECVD` | the listener read the request                 |
//! | `Entered`  | `ENTER` | a granting reply was produced                 |
//! | `TooLate`  | `2LATE` | a rejecting reply was produced                |
//! | `GaveUp`   | `GAVUP` | the reply could not be delivered              |
//! | `TimedUp`  | `TIMUP` | the granted occupancy elapsed                 |
//!
//! Formatting and storage belong to an [`EventSink`]. Every sink also feeds
//! the OpenTelemetry counters in [`telemetry`](crate::server::telemetry).

use crate::server::telemetry::{
    increment_replies_abandoned, increment_requests_entered, increment_requests_received,
    increment_requests_too_late, record_occupancy_duration,
};
use parking_lot::Mutex;
use stallkeeper_core::protocol::{Reply, Request, UNASSIGNED};
use std::{
    fmt,
    io::Write,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Received,
    Entered,
    TooLate,
    GaveUp,
    TimedUp,
}

impl Lifecycle {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Received => "RECVD",
            Self::Entered => "ENTER",
            Self::TooLate => "2LATE",
            Self::GaveUp => "GAVUP",
            Self::TimedUp => "TIMUP",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identifying fields carried by every event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: i32,
    pub pid: i32,
    pub tid: u64,
    pub duration_ms: i32,
    pub place: i32,
}

impl From<&Request> for Record {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id,
            pid: request.client_pid,
            tid: request.client_tid,
            duration_ms: request.duration_ms,
            place: UNASSIGNED,
        }
    }
}

impl From<&Reply> for Record {
    fn from(reply: &Reply) -> Self {
        Self {
            id: reply.id,
            pid: reply.client_pid,
            tid: reply.client_tid,
            duration_ms: reply.granted_ms,
            place: reply.place,
        }
    }
}

/// Destination for lifecycle events.
pub trait EventSink: Send + Sync {
    fn write(&self, event: Lifecycle, record: &Record);
}

/// Records `event` to `sink` and updates the matching metric.
pub fn emit(sink: &dyn EventSink, event: Lifecycle, record: impl Into<Record>) {
    let record = record.into();
    match event {
        Lifecycle::Received => increment_requests_received(),
        Lifecycle::Entered => increment_requests_entered(),
        Lifecycle::TooLate => increment_requests_too_late(),
        Lifecycle::GaveUp => increment_replies_abandoned(),
        Lifecycle::TimedUp => record_occupancy_duration(f64::from(record.duration_ms)),
    }
    sink.write(event, &record);
}

/// Writes events as structured `tracing` events under the
/// `stallkeeper::lifecycle` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn write(&self, event: Lifecycle, record: &Record) {
        tracing::info!(
            target: "stallkeeper::lifecycle",
            event = event.tag(),
            id = record.id,
            pid = record.pid,
            tid = record.tid,
            dur = record.duration_ms,
            pl = record.place,
        );
    }
}

/// Writes `inst ; i ; pid ; tid ; dur ; pl ; oper` lines to stdout, where
/// `inst` is the number of seconds since the sink was created.
#[derive(Debug)]
pub struct LineSink {
    started: Instant,
}

impl LineSink {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn line(elapsed: Duration, event: Lifecycle, record: &Record) -> String {
        format!(
            "{:.3} ; {} ; {} ; {} ; {} ; {} ; {}\n",
            elapsed.as_secs_f64(),
            record.id,
            record.pid,
            record.tid,
            record.duration_ms,
            record.place,
            event
        )
    }
}

impl Default for LineSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LineSink {
    fn write(&self, event: Lifecycle, record: &Record) {
        let line = Self::line(self.started.elapsed(), event, record);
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(line.as_bytes()) {
            tracing::error!("Couldn't write event log: {e}");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(Lifecycle, Record)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Lifecycle, Record)> {
        self.events.lock().clone()
    }

    /// Events recorded for request `id`, in order.
    pub fn for_request(&self, id: i32) -> Vec<Lifecycle> {
        self.events
            .lock()
            .iter()
            .filter(|(_, record)| record.id == id)
            .map(|(event, _)| *event)
            .collect()
    }

    pub fn count(&self, event: Lifecycle) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(e, _)| *e == event)
            .count()
    }
}

impl EventSink for MemorySink {
    fn write(&self, event: Lifecycle, record: &Record) {
        self.events.lock().push((event, *record));
    }
}
