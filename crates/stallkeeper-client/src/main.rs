#![doc = include_str!("../README.md")]

use anyhow::bail;
use clap::Parser;
use rand::Rng;
use stallkeeper_core::{
    Error,
    client::request_access,
    naming::{DEFAULT_FIFO_DIR, inbound_channel_path},
    protocol::{Reply, Request, UNASSIGNED},
};
use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::{interval, sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "stallkeeper-client",
    version,
    about = "Sends a steady stream of requests to a stallkeeper server"
)]
struct CliArgs {
    /// Number of seconds to keep sending requests.
    ///
    /// Environment variable: `RUN_SECS`
    #[arg(short = 't', long = "secs", env = "RUN_SECS")]
    secs: u64,

    /// Name of the server's inbound FIFO inside `--fifo-dir`.
    ///
    /// Environment variable: `FIFO_NAME`
    #[arg(env = "FIFO_NAME")]
    fifoname: String,

    /// Directory holding the inbound FIFO and this client's reply FIFOs.
    ///
    /// Environment variable: `FIFO_DIR`
    #[arg(long, env = "FIFO_DIR", default_value = DEFAULT_FIFO_DIR)]
    fifo_dir: PathBuf,

    /// Pause between two requests, in milliseconds.
    ///
    /// Environment variable: `INTERVAL_MS`
    #[arg(long, env = "INTERVAL_MS", default_value_t = 50)]
    interval_ms: u64,

    /// Shortest occupancy requested, in milliseconds.
    ///
    /// Environment variable: `MIN_MS`
    #[arg(long, env = "MIN_MS", default_value_t = 20)]
    min_ms: i32,

    /// Longest occupancy requested, in milliseconds.
    ///
    /// Environment variable: `MAX_MS`
    #[arg(long, env = "MAX_MS", default_value_t = 500)]
    max_ms: i32,

    /// How long one request may wait for its reply, in milliseconds.
    ///
    /// Environment variable: `REPLY_TIMEOUT_MS`
    #[arg(long, env = "REPLY_TIMEOUT_MS", default_value_t = 30_000)]
    reply_timeout_ms: u64,
}

#[derive(Debug, Clone)]
struct ClientConfig {
    run_for: Duration,
    inbound_path: PathBuf,
    reply_dir: PathBuf,
    interval: Duration,
    durations: (i32, i32),
    reply_timeout: Duration,
}

impl TryFrom<CliArgs> for ClientConfig {
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

        if args.interval_ms == 0 {
            bail!("INTERVAL_MS must be greater than 0");
        }

        if args.min_ms > args.max_ms {
            bail!(
                "MIN_MS ({}) must not exceed MAX_MS ({})",
                args.min_ms,
                args.max_ms
            );
        }

        Ok(Self {
            run_for: Duration::from_secs(args.secs),
            inbound_path: inbound_channel_path(&args.fifo_dir, &args.fifoname),
            reply_dir: args.fifo_dir,
            interval: Duration::from_millis(args.interval_ms),
            durations: (args.min_ms, args.max_ms),
            reply_timeout: Duration::from_millis(args.reply_timeout_ms),
        })
    }
}

/// Client-side lifecycle steps of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Want,
    In,
    Closed,
    Failed,
}

impl Step {
    const fn tag(self) -> &'static str {
        match self {
            Self::Want => "IWANT",
            Self::In => "IAMIN",
            Self::Closed => "CLOSD",
            Self::Failed => "FAILD",
        }
    }

    /// The step a server reply maps to.
    const fn for_reply(reply: &Reply) -> Self {
        if reply.is_granted() {
            Self::In
        } else {
            Self::Closed
        }
    }
}

struct EventLog {
    started: Instant,
}

impl EventLog {
    fn line(&self, step: Step, id: i32, pid: i32, tid: u64, dur: i32, place: i32) -> String {
        format!(
            "{:.3} ; {id} ; {pid} ; {tid} ; {dur} ; {place} ; {}\n",
            self.started.elapsed().as_secs_f64(),
            step.tag()
        )
    }

    fn write(&self, step: Step, id: i32, pid: i32, tid: u64, dur: i32, place: i32) {
        let line = self.line(step, id, pid, tid, dur, place);
        if let Err(e) = std::io::stdout().lock().write_all(line.as_bytes()) {
            tracing::error!("Couldn't write event log: {e}");
        }
    }

    fn request(&self, step: Step, request: &Request) {
        self.write(
            step,
            request.id,
            request.client_pid,
            request.client_tid,
            request.duration_ms,
            UNASSIGNED,
        );
    }

    fn reply(&self, reply: &Reply) {
        self.write(
            Step::for_reply(reply),
            reply.id,
            reply.client_pid,
            reply.client_tid,
            reply.granted_ms,
            reply.place,
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let config = ClientConfig::try_from(CliArgs::parse())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;

    let pid = i32::try_from(std::process::id())?;
    let config = Arc::new(config);
    let log = Arc::new(EventLog {
        started: Instant::now(),
    });
    let closed = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracing::info!(
        "Sending requests to {} for {:?}",
        config.inbound_path.display(),
        config.run_for
    );

    let mut ticks = interval(config.interval);
    let deadline = sleep(config.run_for);
    tokio::pin!(deadline);

    let mut id: i32 = 0;
    loop {
        tokio::select! {
            () = &mut deadline => break,
            () = closed.cancelled() => {
                tracing::info!("Server closed; no further requests");
                break;
            }
            _ = ticks.tick() => {}
        }

        id = id.saturating_add(1);
        let (min, max) = config.durations;
        let duration_ms = rand::rng().random_range(min..=max);
        // Tasks share the process, so the request id stands in for the thread
        // id in the reply channel name.
        let request = Request::new(id, pid, u64::from(id.unsigned_abs()), duration_ms);

        tracker.spawn(send_one(
            request,
            Arc::clone(&config),
            Arc::clone(&log),
            closed.clone(),
        ));
    }

    tracker.close();
    tracker.wait().await;
    tracing::info!("All requests finished");
    Ok(())
}

async fn send_one(
    request: Request,
    config: Arc<ClientConfig>,
    log: Arc<EventLog>,
    closed: CancellationToken,
) {
    log.request(Step::Want, &request);

    match request_access(
        &config.inbound_path,
        &config.reply_dir,
        request,
        config.reply_timeout,
    )
    .await
    {
        Ok(reply) => log.reply(&reply),
        Err(e @ Error::ServerClosed { .. }) => {
            tracing::debug!("Request {}: {e}", request.id);
            log.request(Step::Failed, &request);
            closed.cancel();
        }
        Err(e) => {
            tracing::warn!("Request {} failed: {e}", request.id);
            log.request(Step::Failed, &request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<ClientConfig> {
        let mut full = vec!["stallkeeper-client"];
        full.extend_from_slice(argv);
        ClientConfig::try_from(CliArgs::try_parse_from(full)?)
    }

    #[test]
    fn defaults_apply() {
        let config = parse(&["-t", "3", "stalls"]).unwrap();
        assert_eq!(config.run_for, Duration::from_secs(3));
        assert_eq!(config.inbound_path, PathBuf::from("/tmp/stalls"));
        assert_eq!(config.interval, Duration::from_millis(50));
        assert_eq!(config.durations, (20, 500));
    }

    #[test]
    fn rejects_inverted_duration_range() {
        assert!(parse(&["-t", "3", "--min-ms", "10", "--max-ms", "5", "stalls"]).is_err());
    }

    #[test]
    fn rejects_zero_run_time() {
        assert!(parse(&["-t", "0", "stalls"]).is_err());
    }

    #[test]
    fn replies_map_to_steps() {
        let request = Request::new(1, 2, 3, 40);
        assert_eq!(Step::for_reply(&Reply::granted(&request, 1)), Step::In);
        assert_eq!(Step::for_reply(&Reply::rejected(&request)), Step::Closed);
    }

    #[test]
    fn line_layout_matches_server() {
        let log = EventLog {
            started: Instant::now(),
        };
        let line = log.line(Step::Want, 7, 100, 7, 40, -1);
        assert!(line.ends_with(" ; 7 ; 100 ; 7 ; 40 ; -1 ; IWANT\n"));
    }
}
