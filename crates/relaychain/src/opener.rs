//! Opening address chains.
//!
//! The last hop of a chain is opened directly. Every hop before it gets a
//! local channel (a comm pair): its driver works on one end while a hop
//! thread relays between the other end and the rest of the chain. A forward
//! hop opens its driver here, on the end returned to the caller. A reversed
//! hop opens it inside the hop thread and the caller gets the plain end.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::address::{AddressSpec, Hop, parse_chain};
use crate::commpair::{self, CommPair, PairEnd};
use crate::config::CommKind;
use crate::direction::Direction;
use crate::driver::{self, AddressDesc, Caps, DriverEnv, DriverRegistry, OpenRequest};
use crate::endpoint::{Endpoint, HopTask, Stream};
use crate::engine::TransferSession;
use crate::error::{ChainError, OpenError, OpenStatus, ParseError, Result};
use crate::lockfile::LockFile;
use crate::shutdown;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry allowance of one address, taken from its options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// `None` retries forever.
    left: Option<u32>,
    interval: Duration,
}

impl RetryBudget {
    pub fn for_spec(spec: &AddressSpec) -> Self {
        let opts = &spec.opts;
        Self {
            left: if opts.forever { None } else { Some(opts.retry.unwrap_or(0)) },
            interval: opts.interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
        }
    }

    /// Use up one retry. False once the budget is exhausted.
    pub fn consume(&mut self) -> bool {
        match &mut self.left {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// One address of a hop, resolved to a driver variant.
struct Path<'h> {
    spec: &'h AddressSpec,
    /// What the consumer of the hop does on this path.
    consumer: Direction,
    desc: &'static AddressDesc,
}

impl Path<'_> {
    /// Direction the driver is opened with. A reversed driver sits on the
    /// hop thread's end, which sees the flow the other way round.
    fn driver_direction(&self) -> Direction {
        if self.spec.reverse {
            self.consumer.reverse()
        } else {
            self.consumer
        }
    }

    fn pending(&self, carrier: Stream) -> Slot {
        Slot::Pending {
            spec: self.spec.clone(),
            desc: self.desc,
            direction: self.driver_direction(),
            carrier,
        }
    }
}

/// A stream that is ready, or a driver still to be opened on a carrier.
enum Slot {
    Plain(Stream),
    Pending {
        spec: AddressSpec,
        desc: &'static AddressDesc,
        direction: Direction,
        carrier: Stream,
    },
}

impl Slot {
    fn open(self, env: &DriverEnv, caps: Caps) -> Result<Stream> {
        match self {
            Slot::Plain(stream) => Ok(stream),
            Slot::Pending {
                spec,
                desc,
                direction,
                carrier,
            } => Ok(open_driver(&spec, desc, direction, caps, Some(carrier), env)?),
        }
    }
}

/// The streams of one side of a comm pair, before their drivers open.
enum Side {
    Single(Slot),
    Dual { read: Slot, write: Slot },
}

impl Side {
    fn open(self, env: &DriverEnv, caps: Caps) -> Result<Endpoint> {
        match self {
            Side::Single(slot) => Ok(Endpoint::Single(slot.open(env, caps)?)),
            Side::Dual { read, write } => {
                let read = read.open(env, caps)?;
                match write.open(env, caps) {
                    Ok(write) => Ok(Endpoint::dual(read, write)),
                    Err(e) => {
                        shutdown::close(&mut Endpoint::Single(read));
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Opens chains against a driver registry.
#[derive(Debug, Clone)]
pub struct ChainOpener {
    registry: &'static DriverRegistry,
    env: DriverEnv,
}

impl ChainOpener {
    pub fn new(env: DriverEnv) -> Self {
        Self {
            registry: driver::builtin(),
            env,
        }
    }

    /// Parse and open `text` for a consumer that needs `direction`.
    ///
    /// Nothing is opened if the text does not parse.
    pub fn open_chain(&self, text: &str, direction: Direction) -> Result<Endpoint> {
        let hops = parse_chain(text, self.registry)?;
        tracing::debug!(chain = text, hops = hops.len(), %direction, "opening chain");
        let caps = Caps::MAY_CHILD | Caps::MAY_EXEC;
        self.open_hops(&hops, direction, caps, 0)
    }

    fn open_hops(&self, hops: &[Hop], direction: Direction, caps: Caps, index: usize) -> Result<Endpoint> {
        let (hop, rest) = hops.split_first().ok_or(ParseError::Empty)?;
        if rest.is_empty() {
            self.open_final(hop, direction, caps)
        } else {
            self.open_intermediate(hop, rest, direction, caps, index)
        }
    }

    fn open_final(&self, hop: &Hop, direction: Direction, caps: Caps) -> Result<Endpoint> {
        let paths = plan(hop, direction, true)?;
        let mut streams = Vec::with_capacity(paths.len());
        for path in &paths {
            let opened = with_retry(path.spec, || {
                Ok(open_driver(path.spec, path.desc, path.consumer, caps, None, &self.env)?)
            });
            match opened {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    for stream in streams {
                        shutdown::close(&mut Endpoint::Single(stream));
                    }
                    return Err(e);
                }
            }
        }
        // paths of a dual hop come write path first
        match (streams.pop(), streams.pop()) {
            (Some(only), None) => Ok(Endpoint::Single(only)),
            (Some(read), Some(write)) => Ok(Endpoint::dual(read, write)),
            _ => Err(ParseError::Empty.into()),
        }
    }

    fn open_intermediate(
        &self,
        hop: &Hop,
        rest: &[Hop],
        direction: Direction,
        caps: Caps,
        index: usize,
    ) -> Result<Endpoint> {
        let paths = plan(hop, direction, false)?;
        with_retry(paths[0].spec, || self.try_intermediate(&paths, rest, direction, caps, index))
    }

    fn try_intermediate(
        &self,
        paths: &[Path<'_>],
        rest: &[Hop],
        direction: Direction,
        caps: Caps,
        index: usize,
    ) -> Result<Endpoint> {
        let mut downstream = self.open_hops(rest, direction, caps, index + 1)?;
        let name = format!("hop-{index}");
        let (ours, theirs) = match wire(paths, self.env.config.comm_kind, &name) {
            Ok(sides) => sides,
            Err(e) => {
                shutdown::close(&mut downstream);
                return Err(OpenError::from_io(format!("{name}: comm pair"), e).into());
            }
        };

        let env = DriverEnv {
            config: self.env.config.clone().with_trace(None),
            ..self.env.clone()
        };
        let builder = thread::Builder::new().name(name.clone());
        let handle = start_hop(builder, name.clone(), theirs, downstream, env, caps)?;
        tracing::debug!(hop = %name, "hop task started");

        match ours.open(&self.env, caps) {
            Ok(mut endpoint) => {
                tracing::info!(hop = %name, endpoint = %endpoint.describe(), "hop opened");
                endpoint.attach_task(HopTask::new(name, handle));
                Ok(endpoint)
            }
            Err(e) => {
                // our ends are gone, so the hop engine sees eof and finishes
                HopTask::new(name, handle).join();
                Err(e)
            }
        }
    }
}

/// Start the hop thread. The downstream endpoint is handed over only once
/// the thread runs, so a failed spawn still closes it properly.
fn start_hop(
    builder: thread::Builder,
    name: String,
    side: Side,
    mut downstream: Endpoint,
    env: DriverEnv,
    caps: Caps,
) -> Result<JoinHandle<()>> {
    let (handoff, inbox) = mpsc::channel::<(Side, Endpoint)>();
    let spawned = builder.spawn(move || {
        if let Ok((side, downstream)) = inbox.recv() {
            run_hop(&name, side, downstream, env, caps);
        }
    });
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            shutdown::close(&mut downstream);
            return Err(ChainError::Spawn(e));
        }
    };
    if let Err(mpsc::SendError((_, mut downstream))) = handoff.send((side, downstream)) {
        shutdown::close(&mut downstream);
    }
    Ok(handle)
}

/// Body of a hop thread: open any reversed driver, then relay.
fn run_hop(name: &str, side: Side, mut downstream: Endpoint, env: DriverEnv, caps: Caps) {
    let upstream = match side.open(&env, caps) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(hop = name, error = %e, "hop failed to open");
            shutdown::close(&mut downstream);
            return;
        }
    };
    match TransferSession::new(upstream, downstream, &env.config).run() {
        Ok(summary) => tracing::debug!(
            hop = name,
            outcome = ?summary.outcome,
            a_to_b = summary.bytes_a_to_b,
            b_to_a = summary.bytes_b_to_a,
            "hop finished"
        ),
        Err(e) => tracing::error!(hop = name, error = %e, "hop relay failed"),
    }
}

/// Pick driver variants for the addresses of `hop` a consumer needing
/// `direction` will use. A dual hop yields its write path first.
fn plan(hop: &Hop, direction: Direction, last: bool) -> Result<Vec<Path<'_>>> {
    let wanted = match hop {
        Hop::Single(spec) => vec![(spec, direction)],
        Hop::Dual { a, b } => {
            let mut wanted = Vec::with_capacity(2);
            if direction.can_write() {
                wanted.push((a, Direction::Write));
            }
            if direction.can_read() {
                wanted.push((b, Direction::Read));
            }
            wanted
        }
    };
    wanted
        .into_iter()
        .map(|(spec, consumer)| {
            Ok(Path {
                spec,
                consumer,
                desc: resolve(spec, consumer, last)?,
            })
        })
        .collect()
}

/// Choose among a keyword's variants by the directions the hop needs
/// toward its consumer and, unless last, toward the next hop.
fn resolve(spec: &AddressSpec, consumer: Direction, last: bool) -> Result<&'static AddressDesc> {
    let found = spec.candidates.iter().copied().find(|desc| match (last, spec.reverse) {
        (true, false) => desc.fits(consumer, None),
        (true, true) => false,
        (false, false) => desc.fits(consumer, Some(consumer.reverse())),
        (false, true) => desc.fits(consumer.reverse(), Some(consumer)),
    });
    found.ok_or_else(|| {
        let wanted = match (last, spec.reverse) {
            (true, true) => "reverse use at the end of a chain".to_string(),
            (true, false) => consumer.to_string(),
            (false, _) => format!("{consumer} with a following hop"),
        };
        ChainError::NoMatchingVariant {
            keyword: spec.keyword.clone(),
            wanted,
        }
    })
}

/// Create the comm pair(s) of an intermediate hop and decide on which end
/// each driver opens. Returns (caller side, hop thread side).
fn wire(paths: &[Path<'_>], kind: CommKind, name: &str) -> std::io::Result<(Side, Side)> {
    let plain = |end: PairEnd| end.into_stream(name);

    match paths {
        [path] => {
            let c = path.consumer;
            let CommPair { left, right } = commpair::open(kind, c.can_write(), c.can_read(), false)?;
            Ok(if path.spec.reverse {
                (Side::Single(Slot::Plain(plain(left))), Side::Single(path.pending(plain(right))))
            } else {
                (Side::Single(path.pending(plain(left))), Side::Single(Slot::Plain(plain(right))))
            })
        }
        [a, b] if a.spec.reverse == b.spec.reverse => {
            let CommPair { left, right } = commpair::open(kind, true, true, true)?;
            if a.spec.reverse {
                let (read, write) = right.split()?;
                let theirs = Side::Dual {
                    read: a.pending(plain(read)),
                    write: b.pending(plain(write)),
                };
                Ok((Side::Single(Slot::Plain(plain(left))), theirs))
            } else {
                let (read, write) = left.split()?;
                let ours = Side::Dual {
                    read: b.pending(plain(read)),
                    write: a.pending(plain(write)),
                };
                Ok((ours, Side::Single(Slot::Plain(plain(right)))))
            }
        }
        [a, b] => {
            // Mixed orientation needs one channel per direction, or data
            // would reach the wrong party.
            let to_right = commpair::open(kind, true, false, false)?;
            let to_left = commpair::open(kind, false, true, false)?;

            let (our_write, their_read) = if a.spec.reverse {
                (Slot::Plain(plain(to_right.left)), a.pending(plain(to_right.right)))
            } else {
                (a.pending(plain(to_right.left)), Slot::Plain(plain(to_right.right)))
            };
            let (our_read, their_write) = if b.spec.reverse {
                (Slot::Plain(plain(to_left.left)), b.pending(plain(to_left.right)))
            } else {
                (b.pending(plain(to_left.left)), Slot::Plain(plain(to_left.right)))
            };
            Ok((
                Side::Dual {
                    read: our_read,
                    write: our_write,
                },
                Side::Dual {
                    read: their_read,
                    write: their_write,
                },
            ))
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "hop has no usable address",
        )),
    }
}

/// Open one address: take its lock, call the driver, apply the options.
fn open_driver(
    spec: &AddressSpec,
    desc: &'static AddressDesc,
    direction: Direction,
    caps: Caps,
    carrier: Option<Stream>,
    env: &DriverEnv,
) -> std::result::Result<Stream, OpenError> {
    let lock = spec
        .opts
        .lock
        .as_ref()
        .map(LockFile::acquire)
        .transpose()
        .map_err(|e| OpenError::from_io(format!("{}: lock", desc.keyword), e))?;

    tracing::debug!(keyword = desc.keyword, params = ?spec.params, %direction, "opening address");
    let mut stream = (desc.open)(OpenRequest {
        keyword: desc.keyword,
        params: &spec.params,
        options: &spec.opts,
        direction,
        caps,
        args: desc.args,
        carrier,
        env,
    })?;
    stream
        .apply_options(&spec.opts)
        .map_err(|e| OpenError::from_io(format!("{}: options", desc.keyword), e))?;
    Ok(match lock {
        Some(lock) => stream.with_lock(lock),
        None => stream,
    })
}

/// Run `attempt` until it succeeds, fails permanently, or `spec`'s retry
/// budget runs out.
fn with_retry<T>(spec: &AddressSpec, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let mut budget = RetryBudget::for_spec(spec);
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && budget.consume() => {
                tracing::warn!(keyword = %spec.keyword, error = %e, "open failed, retrying");
                if e.status() == OpenStatus::RetryLater {
                    thread::sleep(budget.interval);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use std::time::Instant;

    fn opener(kind: CommKind) -> ChainOpener {
        ChainOpener::new(DriverEnv {
            reaper: None,
            config: RelayConfig::default()
                .with_comm_kind(kind)
                .with_close_wait(Duration::from_millis(100)),
        })
    }

    fn read_exactly(ep: &mut Endpoint, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < len {
            let n = match ep.read_block(&mut buf) {
                // a record layer waiting for the rest of a frame
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                other => other.unwrap(),
            };
            assert!(n > 0, "eof after {out:?}");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn echo(chain: &str, kind: CommKind, input: &[u8]) -> Vec<u8> {
        let mut ep = opener(kind).open_chain(chain, Direction::ReadWrite).unwrap();
        assert_eq!(ep.write_block(input).unwrap(), input.len());
        let len = input.len() + usize::from(chain.starts_with("TEST") || chain.starts_with("^TEST"));
        let out = read_exactly(&mut ep, len);
        shutdown::close(&mut ep);
        out
    }

    #[test]
    fn two_hop_chain_is_duplex_for_every_pair_kind() {
        for kind in [CommKind::SocketPairs, CommKind::Pipes, CommKind::SocketPair, CommKind::Tcp] {
            assert_eq!(echo("NOP|PIPE", kind, b"hello"), b"hello", "{kind:?}");
        }
    }

    #[test]
    fn two_hop_chain_is_duplex_over_ptys() {
        for kind in [CommKind::Ptys, CommKind::Pty] {
            assert_eq!(echo("NOP|PIPE", kind, b"hello"), b"hello", "{kind:?}");
        }
    }

    #[test]
    fn write_shutdown_travels_through_the_hop_and_back() {
        for kind in [CommKind::SocketPairs, CommKind::Ptys, CommKind::Pty] {
            let mut ep = opener(kind).open_chain("NOP|PIPE", Direction::ReadWrite).unwrap();
            ep.write_block(b"x").unwrap();
            assert_eq!(read_exactly(&mut ep, 1), b"x", "{kind:?}");

            shutdown::shutdown(&mut ep, shutdown::ShutdownHow::Write);
            let mut buf = [0u8; 8];
            let n = loop {
                match ep.read_block(&mut buf) {
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    other => break other.unwrap(),
                }
            };
            assert_eq!(n, 0, "{kind:?}");
            shutdown::close(&mut ep);
        }
    }

    #[test]
    fn failed_hop_spawn_closes_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("downstream");
        std::fs::write(&artifact, b"").unwrap();
        let (r, _w) = std::io::pipe().unwrap();
        let downstream = Stream::new(
            "downstream",
            crate::endpoint::StreamFds::split(Some(std::fs::File::from(std::os::fd::OwnedFd::from(r))), None),
            Direction::Read,
            crate::endpoint::ShutdownPolicy::both(crate::endpoint::ShutdownAction::Close),
            crate::endpoint::ClosePolicy::Close,
        )
        .with_unlink_on_close(&artifact);

        let pair = commpair::open(CommKind::SocketPairs, true, true, false).unwrap();
        // no address space can hold this stack
        let builder = thread::Builder::new().stack_size(1 << 47);
        let err = start_hop(
            builder,
            "hop-test".into(),
            Side::Single(Slot::Plain(pair.right.into_stream("hop-test"))),
            Endpoint::Single(downstream),
            DriverEnv::default(),
            Caps::empty(),
        )
        .unwrap_err();

        assert!(matches!(err, ChainError::Spawn(_)), "{err}");
        assert!(!artifact.exists());
    }

    #[test]
    fn reversed_hop_opens_in_hop_thread() {
        assert_eq!(echo("^NOP|PIPE", CommKind::SocketPairs, b"abc"), b"abc");
        assert_eq!(echo("^TEST|PIPE", CommKind::SocketPairs, b"abc"), b"abc>");
    }

    #[test]
    fn mixed_dual_hop_keeps_directions_apart() {
        assert_eq!(echo("NOP%^NOP|PIPE", CommKind::SocketPairs, b"xyz"), b"xyz");
        assert_eq!(echo("^NOP%NOP|PIPE", CommKind::Pipes, b"xyz"), b"xyz");
        assert_eq!(echo("NOP%NOP|PIPE", CommKind::SocketPair, b"xyz"), b"xyz");
    }

    #[test]
    fn test_hop_marks_written_blocks() {
        assert_eq!(echo("TEST|PIPE", CommKind::SocketPairs, b"abc"), b"abc>");
    }

    #[test]
    fn frame_hop_round_trips_through_echo() {
        assert_eq!(echo("FRAME|PIPE", CommKind::SocketPairs, b"framed"), b"framed");
    }

    #[test]
    fn three_hop_chain() {
        assert_eq!(echo("NOP|NOP|PIPE", CommKind::SocketPairs, b"deep"), b"deep");
    }

    #[test]
    fn endpoint_cannot_sit_in_the_middle() {
        let err = opener(CommKind::SocketPairs)
            .open_chain("PIPE|PIPE", Direction::ReadWrite)
            .unwrap_err();
        assert!(matches!(err, ChainError::NoMatchingVariant { ref keyword, .. } if keyword == "PIPE"));
        assert!(!err.is_retryable());

        let err = opener(CommKind::SocketPairs)
            .open_chain("^NOP", Direction::ReadWrite)
            .unwrap_err();
        assert!(matches!(err, ChainError::NoMatchingVariant { .. }));
    }

    #[test]
    fn write_only_consumer_gets_write_only_stdout() {
        let ep = opener(CommKind::SocketPairs)
            .open_chain("STDOUT", Direction::Write)
            .unwrap();
        assert_eq!(ep.direction(), Direction::Write);
        assert!(
            opener(CommKind::SocketPairs)
                .open_chain("STDOUT", Direction::Read)
                .is_err()
        );
    }

    #[test]
    fn refused_connect_uses_retry_budget() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let chain = format!("TCP:127.0.0.1:{port},retry=2,interval=0.05");
        let started = Instant::now();
        let err = opener(CommKind::SocketPairs)
            .open_chain(&chain, Direction::ReadWrite)
            .unwrap_err();
        assert_eq!(err.status(), OpenStatus::RetryLater);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn held_lock_defers_open() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("pipe.lock");
        let chain = format!("PIPE,lock={}", lock_path.display());

        let held = LockFile::acquire(&lock_path).unwrap();
        let err = opener(CommKind::SocketPairs)
            .open_chain(&chain, Direction::ReadWrite)
            .unwrap_err();
        assert_eq!(err.status(), OpenStatus::RetryLater);
        drop(held);

        let mut ep = opener(CommKind::SocketPairs)
            .open_chain(&chain, Direction::ReadWrite)
            .unwrap();
        assert!(lock_path.exists());
        shutdown::close(&mut ep);
        assert!(!lock_path.exists());
    }

    #[test]
    fn retry_budget_counts_down() {
        let spec = crate::address::parse_single("PIPE,retry=2", driver::builtin()).unwrap();
        let mut budget = RetryBudget::for_spec(&spec);
        assert!(budget.consume());
        assert!(budget.consume());
        assert!(!budget.consume());

        let spec = crate::address::parse_single("PIPE,forever", driver::builtin()).unwrap();
        let mut budget = RetryBudget::for_spec(&spec);
        assert!((0..100).all(|_| budget.consume()));
    }
}
