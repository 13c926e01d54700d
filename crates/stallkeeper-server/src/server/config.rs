use anyhow::bail;
use clap::{Parser, ValueEnum};
use stallkeeper_core::naming::{DEFAULT_FIFO_DIR, inbound_channel_path};
use std::{path::PathBuf, time::Duration};
use tokio::sync::Semaphore;

/// Runtime configuration for the `stallkeeper-server` binary.
///
/// These settings control how long the server admits requests, the two
/// admission limits, and where the FIFOs live. All values are parsed from CLI
/// arguments or environment variables and are fixed for the lifetime of the
/// process.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stallkeeper-server",
    version,
    about = "Admission-control server for a bounded shared resource"
)]
pub struct CliArgs {
    /// Number of seconds to accept requests before draining.
    ///
    /// Environment variable: `RUN_SECS`
    #[arg(short = 't', long = "secs", env = "RUN_SECS")]
    pub secs: u64,

    /// Number of places in the shared resource.
    ///
    /// Omit for an unlimited resource; replies then carry a running sequence
    /// number instead of a place.
    ///
    /// Environment variable: `PLACES`
    #[arg(short = 'l', long = "places", env = "PLACES")]
    pub places: Option<usize>,

    /// Maximum number of requests processed concurrently.
    ///
    /// Omit for no limit.
    ///
    /// Environment variable: `THREADS`
    #[arg(short = 'n', long = "threads", env = "THREADS")]
    pub threads: Option<usize>,

    /// Name of the inbound FIFO, created inside `--fifo-dir`.
    ///
    /// Environment variable: `FIFO_NAME`
    #[arg(env = "FIFO_NAME")]
    pub fifoname: String,

    /// Directory holding the inbound FIFO and every client reply FIFO.
    ///
    /// Environment variable: `FIFO_DIR`
    #[arg(long, env = "FIFO_DIR", default_value = DEFAULT_FIFO_DIR)]
    pub fifo_dir: PathBuf,

    /// Where lifecycle events are written.
    ///
    /// Environment variable: `EVENTS`
    #[arg(long, env = "EVENTS", value_enum, default_value_t = EventFormat::Lines)]
    pub events: EventFormat,

    /// Pause after an empty read while still accepting, in milliseconds.
    ///
    /// Environment variable: `EOF_BACKOFF_MS`
    #[arg(long, env = "EOF_BACKOFF_MS", default_value_t = 10)]
    pub eof_backoff_ms: u64,

    /// How long a drain-mode read may wait for a buffered request, in
    /// milliseconds.
    ///
    /// Environment variable: `DRAIN_IDLE_MS`
    #[arg(long, env = "DRAIN_IDLE_MS", default_value_t = 200)]
    pub drain_idle_ms: u64,

    /// Pause before retrying a failed worker spawn, in milliseconds.
    ///
    /// Environment variable: `SPAWN_RETRY_MS`
    #[arg(long, env = "SPAWN_RETRY_MS", default_value_t = 1)]
    pub spawn_retry_ms: u64,
}

/// Lifecycle event output.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// One `inst ; i ; pid ; tid ; dur ; pl ; oper` line per event on stdout.
    Lines,
    /// Structured `tracing` events.
    Tracing,
}

/// Capacity of one admission pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Bounded(usize),
    Unlimited,
}

impl Limit {
    pub const fn bounded(&self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(*n),
            Self::Unlimited => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub run_for: Duration,
    pub worker_limit: Limit,
    pub resource_limit: Limit,
    pub inbound_path: PathBuf,
    pub reply_dir: PathBuf,
    pub events: EventFormat,
    pub eof_backoff: Duration,
    pub drain_idle: Duration,
    pub spawn_retry: Duration,
}

impl ServerConfig {
    /// A configuration with both pools unlimited and default timings.
    pub fn new(fifo_dir: impl Into<PathBuf>, fifoname: &str, run_for: Duration) -> Self {
        let reply_dir = fifo_dir.into();
        Self {
            run_for,
            worker_limit: Limit::Unlimited,
            resource_limit: Limit::Unlimited,
            inbound_path: inbound_channel_path(&reply_dir, fifoname),
            reply_dir,
            events: EventFormat::Lines,
            eof_backoff: Duration::from_millis(10),
            drain_idle: Duration::from_millis(200),
            spawn_retry: Duration::from_millis(1),
        }
    }

    #[must_use]
    pub fn with_worker_limit(mut self, limit: Limit) -> Self {
        self.worker_limit = limit;
        self
    }

    #[must_use]
    pub fn with_resource_limit(mut self, limit: Limit) -> Self {
        self.resource_limit = limit;
        self
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.secs == 0 {
            bail!("RUN_SECS must be greater than 0");
        }

        if args.fifoname.is_empty() || args.fifoname.contains('/') {
            bail!(
                "FIFO_NAME ({:?}) must be a non-empty name without path separators",
                args.fifoname
            );
        }

        let worker_limit = match args.threads {
            Some(0) => bail!("THREADS must be greater than 0"),
            Some(n) if n > Semaphore::MAX_PERMITS => {
                bail!("THREADS ({n}) exceeds the limit of {}", Semaphore::MAX_PERMITS)
            }
            Some(n) => Limit::Bounded(n),
            None => Limit::Unlimited,
        };

        let resource_limit = match args.places {
            Some(0) => bail!("PLACES must be greater than 0"),
            // Places are reported as a one-based i32 on the wire.
            Some(n) if n >= i32::MAX as usize => {
                bail!("PLACES ({n}) exceeds the wire format's place range")
            }
            Some(n) if n > Semaphore::MAX_PERMITS => {
                bail!("PLACES ({n}) exceeds the limit of {}", Semaphore::MAX_PERMITS)
            }
            Some(n) => Limit::Bounded(n),
            None => Limit::Unlimited,
        };

        Ok(Self {
            run_for: Duration::from_secs(args.secs),
            worker_limit,
            resource_limit,
            inbound_path: inbound_channel_path(&args.fifo_dir, &args.fifoname),
            reply_dir: args.fifo_dir,
            events: args.events,
            eof_backoff: Duration::from_millis(args.eof_backoff_ms),
            drain_idle: Duration::from_millis(args.drain_idle_ms),
            spawn_retry: Duration::from_millis(args.spawn_retry_ms),
        })
    }
}
