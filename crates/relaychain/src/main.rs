//! relaychain command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};

use relaychain::config::{DEFAULT_BUFFER_SIZE, DEFAULT_CLOSE_WAIT, DEFAULT_POLL_INTERVAL};
use relaychain::logging::{LogFormat, init_tracing};
use relaychain::{CommKind, DirectionMode, LockFile, Relay, RelayConfig, TraceMode, reaper};

const LOCK_POLL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "relaychain", version, about = "Relay bytes between two address chains")]
struct Args {
    /// Diagnostic verbosity; repeat for more (-dd for debug).
    #[arg(short = 'd', action = ArgAction::Count)]
    debug: u8,

    #[arg(long, value_enum, env = "RELAYCHAIN_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Mirror transferred data to stderr as text.
    #[arg(short = 'v')]
    text_trace: bool,

    /// Mirror transferred data to stderr as hex.
    #[arg(short = 'x')]
    hex_trace: bool,

    /// Bytes moved per read.
    #[arg(short = 'b', value_name = "SIZE", env = "RELAYCHAIN_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Seconds to wait for the other direction after one side ended.
    #[arg(short = 't', value_name = "SECS", value_parser = parse_secs)]
    close_wait: Option<Duration>,

    /// End the relay after this many seconds without data.
    #[arg(short = 'T', value_name = "SECS", value_parser = parse_secs)]
    total_timeout: Option<Duration>,

    /// Re-poll cadence for addresses with ignoreeof.
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    poll_interval: Option<Duration>,

    /// Only relay from the first address to the second.
    #[arg(short = 'u', conflicts_with = "right_to_left")]
    left_to_right: bool,

    /// Only relay from the second address to the first.
    #[arg(short = 'U')]
    right_to_left: bool,

    /// Channel type between chain hops.
    #[arg(short = 'c', value_name = "KIND", env = "RELAYCHAIN_COMM", default_value = "socketpairs")]
    comm: CommKind,

    /// Fail if this lock file is held.
    #[arg(short = 'L', value_name = "LOCKFILE", conflicts_with = "wait_lock")]
    lock: Option<PathBuf>,

    /// Wait until this lock file is free.
    #[arg(short = 'W', value_name = "LOCKFILE")]
    wait_lock: Option<PathBuf>,

    /// First address chain.
    first: String,

    /// Second address chain.
    second: String,
}

impl Args {
    fn config(&self) -> RelayConfig {
        let direction = match (self.left_to_right, self.right_to_left) {
            (true, _) => DirectionMode::LeftToRight,
            (_, true) => DirectionMode::RightToLeft,
            _ => DirectionMode::Bidirectional,
        };
        RelayConfig::default()
            .with_buffer_size(self.buffer_size)
            .with_close_wait(self.close_wait.unwrap_or(DEFAULT_CLOSE_WAIT))
            .with_poll_interval(self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL))
            .with_total_timeout(self.total_timeout)
            .with_direction(direction)
            .with_comm_kind(self.comm)
            .with_trace(TraceMode::from_flags(self.text_trace, self.hex_trace))
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("invalid number of seconds \"{s}\""))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug, args.log_format);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let lock = match (&args.lock, &args.wait_lock) {
        (Some(path), _) => Some(LockFile::acquire(path).with_context(|| format!("lock {}", path.display()))?),
        (None, Some(path)) => {
            let path = path.clone();
            let waited = tokio::task::spawn_blocking(move || LockFile::wait(&path, LOCK_POLL))
                .await
                .context("lock wait panicked")?;
            Some(waited.context("waiting for lock")?)
        }
        (None, None) => None,
    };

    let config = args.config();
    tracing::debug!(?config, "starting relay");
    let (reaper, _reaper_task) = reaper::spawn();
    let relay = Relay::new(config, Some(reaper));
    let (first, second) = (args.first, args.second);
    let mut task = tokio::task::spawn_blocking(move || relay.run(&first, &second));

    let summary = tokio::select! {
        joined = &mut task => joined.context("relay task panicked")??,
        signo = interrupted() => {
            let signo = signo.context("installing signal handlers")?;
            tracing::warn!(signal = signo, "exiting on signal");
            drop(lock);
            // the relay thread cannot be cancelled; leave without waiting for it
            std::process::exit(128 + signo);
        }
    };

    tracing::info!(
        summary = %serde_json::to_string(&summary).unwrap_or_default(),
        "relay finished"
    );
    drop(lock);
    Ok(if summary.io_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Wait for SIGINT, SIGTERM or SIGHUP and return its number.
async fn interrupted() -> std::io::Result<i32> {
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let signal = tokio::select! {
        _ = int.recv() => Signal::SIGINT,
        _ = term.recv() => Signal::SIGTERM,
        _ = hup.recv() => Signal::SIGHUP,
    };
    Ok(signal as i32)
}
