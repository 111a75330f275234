//! The bidirectional transfer loop.
//!
//! One [`TransferSession`] owns two endpoints and copies between them until
//! both read sides have ended, the inactivity timeout fires, or the close
//! grace period after the first end of file runs out. The loop waits with
//! `poll(2)` on up to four descriptors: A-read, B-write, B-read, A-write.

pub mod trace;
mod transfer;

use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::Serialize;

use crate::config::RelayConfig;
use crate::endpoint::{CLOSING_FULL, CLOSING_GRACE, CLOSING_HALF, EOF_CHILD_GONE, EOF_ENDED, Endpoint};
use crate::error::EngineError;
use crate::shutdown::{self, ShutdownHow};

pub use trace::TraceSink;
pub use transfer::convert_line_terms;

use transfer::{Moved, transfer};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Both read sides reached end of file.
    Completed,
    /// Nothing moved for the configured total timeout.
    InactivityTimeout,
    /// One side ended and the other stayed quiet past the close grace period.
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub outcome: Outcome,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub ignored_eofs: u64,
    /// `eof` of both read streams when the loop ended.
    pub final_eof: [u8; 2],
    /// A read or write failed during the session.
    pub io_error: bool,
}

/// Per-direction loop bookkeeping, indexed by the source endpoint.
#[derive(Debug, Default)]
struct Flags {
    may_read: bool,
    may_write: bool,
    /// The peer's write side has been shut down after this side's eof.
    peer_shut: bool,
    /// An ignored eof parks this source until the instant given.
    parked_until: Option<Instant>,
}

pub struct TransferSession {
    eps: [Endpoint; 2],
    buffer_size: usize,
    close_wait: Duration,
    poll_interval: Duration,
    total_timeout: Option<Duration>,
    buf: Vec<u8>,
    trace: Option<TraceSink>,
}

impl TransferSession {
    pub fn new(a: Endpoint, b: Endpoint, config: &RelayConfig) -> Self {
        // line-end conversion may double a block
        let buf = Vec::with_capacity(2 * config.buffer_size + 1);
        Self {
            eps: [a, b],
            buffer_size: config.buffer_size,
            close_wait: config.close_wait,
            poll_interval: config.poll_interval,
            total_timeout: config.total_timeout,
            buf,
            trace: config.trace.map(TraceSink::stderr),
        }
    }

    pub fn with_trace_sink(mut self, sink: TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Relay until done. Both endpoints are closed before this returns,
    /// whatever the result.
    pub fn run(mut self) -> Result<SessionSummary, EngineError> {
        let result = self.relay();
        for ep in &self.eps {
            ep.read_stream().state.raise_closing(CLOSING_FULL);
        }
        for ep in &mut self.eps {
            shutdown::close(ep);
        }
        if let Ok(summary) = &result {
            tracing::info!(
                outcome = ?summary.outcome,
                a_to_b = summary.bytes_a_to_b,
                b_to_a = summary.bytes_b_to_a,
                "transfer loop finished"
            );
        }
        result
    }

    fn relay(&mut self) -> Result<SessionSummary, EngineError> {
        let mut flags = [Flags::default(), Flags::default()];
        let mut moved = [0u64; 2];
        let mut ignored_eofs = 0u64;
        let mut io_error = false;
        let mut last_activity = Instant::now();
        let mut grace_since: Option<Instant> = None;

        tracing::info!(
            a = %self.eps[0].describe(),
            b = %self.eps[1].describe(),
            "starting data transfer loop"
        );

        let outcome = loop {
            for i in 0..2 {
                self.settle(i)?;
                self.finish_ended(i, &mut flags);
            }
            if !(self.active(0) || self.active(1)) {
                break Outcome::Completed;
            }

            let now = Instant::now();
            if self.closing() {
                for ep in &self.eps {
                    ep.read_stream().state.advance_closing(CLOSING_HALF, CLOSING_GRACE);
                }
                grace_since.get_or_insert(now);
            }
            let inactivity = self.total_timeout.map(|t| last_activity + t);
            let grace = grace_since.map(|since| since.max(last_activity) + self.close_wait);
            if inactivity.is_some_and(|d| now >= d) {
                tracing::info!("inactivity timeout triggered");
                break Outcome::InactivityTimeout;
            }
            if grace.is_some_and(|d| now >= d) {
                tracing::debug!("close grace period expired");
                break Outcome::GraceExpired;
            }
            for f in &mut flags {
                if f.parked_until.is_some_and(|d| now >= d) {
                    f.parked_until = None;
                }
            }

            let deadline = [inactivity, grace, flags[0].parked_until, flags[1].parked_until]
                .into_iter()
                .flatten()
                .min();
            if !self.wait(&mut flags, deadline)? {
                continue;
            }

            let mut hit_eof = [false; 2];
            for from in 0..2 {
                let to = 1 - from;
                if !(flags[from].may_read && flags[to].may_write) {
                    continue;
                }
                flags[from].may_read = false;

                let (src, dst) = pair_mut(&mut self.eps, from);
                let result = transfer(
                    src,
                    dst,
                    &mut self.buf,
                    self.buffer_size,
                    self.trace.as_mut(),
                    from == 1,
                );
                match result {
                    Ok(Moved::Bytes(n)) => {
                        flags[to].may_write = false;
                        moved[from] += n as u64;
                        last_activity = Instant::now();
                        let rs = src.read_stream();
                        flags[from].may_read = rs.pending() > 0 || rs.read_limit == Some(0);
                        hit_eof[from] = rs.escape_seen;
                    }
                    Ok(Moved::Nothing) => {
                        let rs = src.read_stream();
                        flags[from].may_read = rs.pending() > 0;
                        hit_eof[from] = rs.escape_seen;
                    }
                    Ok(Moved::Eof) => hit_eof[from] = true,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        io_error = true;
                        tracing::warn!(
                            from = %src.read_stream().name,
                            to = %dst.write_stream().name,
                            error = %e,
                            "transfer direction is in error"
                        );
                    }
                }
            }

            for from in 0..2 {
                let rs = self.eps[from].read_stream();
                if hit_eof[from] && rs.state.eof() < EOF_ENDED {
                    // zero-length read on an ignore-eof source
                    ignored_eofs += 1;
                    tracing::debug!(stream = %rs.name, "end of file ignored");
                    flags[from].parked_until = Some(Instant::now() + self.poll_interval);
                }
            }
        };

        Ok(SessionSummary {
            outcome,
            bytes_a_to_b: moved[0],
            bytes_b_to_a: moved[1],
            ignored_eofs,
            final_eof: [
                self.eps[0].read_stream().state.eof(),
                self.eps[1].read_stream().state.eof(),
            ],
            io_error,
        })
    }

    /// The endpoint still has a read side worth waiting on.
    fn active(&self, i: usize) -> bool {
        let ep = &self.eps[i];
        ep.is_readable() && ep.read_stream().state.eof() < EOF_ENDED
    }

    fn closing(&self) -> bool {
        self.eps
            .iter()
            .any(|ep| ep.read_stream().state.closing() >= CLOSING_HALF)
    }

    /// Resolve read sides that cannot produce more data.
    ///
    /// A stream whose child has exited gets one zero-timeout readiness check:
    /// with nothing left to read its eof becomes final.
    fn settle(&self, i: usize) -> Result<(), EngineError> {
        let ep = &self.eps[i];
        if !ep.is_readable() {
            return Ok(());
        }
        let rs = ep.read_stream();
        let Some(file) = rs.fds.read_file() else {
            if rs.state.eof() < EOF_ENDED {
                tracing::debug!(stream = %rs.name, "read side closed");
                rs.state.raise_eof(EOF_ENDED);
            }
            return Ok(());
        };
        if rs.state.eof() != EOF_CHILD_GONE || rs.pending() > 0 {
            return Ok(());
        }
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        let ready = loop {
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) => break n > 0,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(EngineError::Poll(e)),
            }
        };
        if !ready {
            tracing::info!(stream = %rs.name, "terminated child did not leave data for us");
            rs.state.raise_eof(EOF_ENDED);
            rs.state.raise_closing(CLOSING_HALF);
        }
        Ok(())
    }

    /// Once a read side has ended for good, half-close the peer's write
    /// side and put the peer into closing.
    fn finish_ended(&mut self, from: usize, flags: &mut [Flags; 2]) {
        let to = 1 - from;
        if self.eps[from].read_stream().state.eof() < EOF_ENDED || !self.eps[from].is_readable() {
            return;
        }
        if !flags[from].peer_shut {
            flags[from].peer_shut = true;
            tracing::info!(
                stream = %self.eps[from].read_stream().name,
                fd = self.eps[from].read_stream().fds.raw_read(),
                "end of file reached"
            );
            shutdown::shutdown(&mut self.eps[to], ShutdownHow::Write);
        }
        self.eps[to].read_stream().state.raise_closing(CLOSING_HALF);
    }

    /// Wait for readiness. Returns false when the wait timed out.
    fn wait(&self, flags: &mut [Flags; 2], deadline: Option<Instant>) -> Result<bool, EngineError> {
        // slots: A-read, B-write, B-read, A-write
        let mut slots = [None; 4];
        for from in 0..2 {
            let to = 1 - from;
            let src = &self.eps[from];
            let rs = src.read_stream();
            if !(src.is_readable() && rs.state.eof() < EOF_ENDED) {
                continue;
            }
            if !flags[from].may_read && flags[from].parked_until.is_none() {
                slots[from * 2] = rs.fds.read_fd().map(|fd| (fd, PollFlags::POLLIN));
            }
            if !flags[to].may_write {
                slots[from * 2 + 1] = self.eps[to]
                    .write_stream()
                    .fds
                    .write_fd()
                    .map(|fd| (fd, PollFlags::POLLOUT));
            }
        }

        let mut index = [None; 4];
        let mut fds = Vec::with_capacity(4);
        for (slot, entry) in slots.iter().enumerate() {
            if let Some((fd, events)) = entry {
                index[slot] = Some(fds.len());
                fds.push(PollFd::new(*fd, *events));
            }
        }
        // a transfer that is already possible must not wait
        let runnable = (flags[0].may_read && flags[1].may_write) || (flags[1].may_read && flags[0].may_write);
        if fds.is_empty() && deadline.is_none() && !runnable {
            // nothing can ever become ready; treat both sides as finished
            tracing::warn!("no descriptors left to wait on");
            for ep in &self.eps {
                ep.read_stream().state.raise_eof(EOF_ENDED);
            }
            return Ok(false);
        }

        let ready = loop {
            let timeout = match deadline {
                _ if runnable => PollTimeout::ZERO,
                Some(d) => poll_timeout(d.saturating_duration_since(Instant::now())),
                None => PollTimeout::NONE,
            };
            match poll(&mut fds, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {
                    tracing::trace!("poll interrupted, recomputing timeout");
                    continue;
                }
                Err(e) => return Err(EngineError::Poll(e)),
            }
        };
        if ready == 0 {
            return Ok(runnable);
        }

        for (slot, at) in index.iter().enumerate() {
            let Some(at) = *at else { continue };
            let Some(revents) = fds[at].revents() else { continue };
            if revents.is_empty() {
                continue;
            }
            if revents.contains(PollFlags::POLLNVAL) {
                let fd = slots[slot].map_or(-1, |(fd, _)| std::os::fd::AsRawFd::as_raw_fd(&fd));
                return Err(EngineError::InvalidDescriptor { fd });
            }
            match slot {
                0 => flags[0].may_read = true,
                1 => flags[1].may_write = true,
                2 => flags[1].may_read = true,
                _ => flags[0].may_write = true,
            }
        }
        Ok(true)
    }
}

fn pair_mut(eps: &mut [Endpoint; 2], from: usize) -> (&mut Endpoint, &mut Endpoint) {
    let [a, b] = eps;
    if from == 0 { (a, b) } else { (b, a) }
}

/// Millisecond poll timeout, rounded up and capped at what poll accepts.
fn poll_timeout(left: Duration) -> PollTimeout {
    let ms = left.as_nanos().div_ceil(1_000_000);
    PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    use crate::direction::Direction;
    use crate::endpoint::{ClosePolicy, ShutdownAction, ShutdownPolicy, Stream, StreamFds};
    use crate::reaper::ChildExit;

    fn config() -> RelayConfig {
        RelayConfig::default()
            .with_close_wait(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(20))
    }

    fn reader(name: &str, file: File) -> Endpoint {
        Endpoint::Single(Stream::new(
            name,
            StreamFds::split(Some(file), None),
            Direction::Read,
            ShutdownPolicy::both(ShutdownAction::Close),
            ClosePolicy::Close,
        ))
    }

    fn writer(name: &str, file: File) -> Endpoint {
        Endpoint::Single(Stream::new(
            name,
            StreamFds::split(None, Some(file)),
            Direction::Write,
            ShutdownPolicy::both(ShutdownAction::None),
            ClosePolicy::Close,
        ))
    }

    fn socket(name: &str, sock: UnixStream) -> Endpoint {
        Endpoint::Single(Stream::new(
            name,
            StreamFds::Single(File::from(OwnedFd::from(sock))),
            Direction::ReadWrite,
            ShutdownPolicy::socket(),
            ClosePolicy::Close,
        ))
    }

    fn pipe() -> (File, File) {
        let (r, w) = std::io::pipe().unwrap();
        (File::from(OwnedFd::from(r)), File::from(OwnedFd::from(w)))
    }

    #[test]
    fn copies_file_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        let dst = dir.path().join("out");
        std::fs::write(&src, b"hello").unwrap();

        let a = reader("in", File::open(&src).unwrap());
        let b = writer("out", File::create(&dst).unwrap());
        let summary = TransferSession::new(a, b, &config()).run().unwrap();

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(summary.bytes_a_to_b, 5);
        assert!(!summary.io_error);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn relays_both_directions_and_half_closes() {
        let (a, mut peer_a) = UnixStream::pair().unwrap();
        let (b, mut peer_b) = UnixStream::pair().unwrap();
        peer_a.write_all(b"from a").unwrap();
        peer_a.shutdown(std::net::Shutdown::Write).unwrap();
        peer_b.write_all(b"from b").unwrap();
        peer_b.shutdown(std::net::Shutdown::Write).unwrap();

        let session = TransferSession::new(socket("a", a), socket("b", b), &config());
        let summary = std::thread::spawn(move || session.run()).join().unwrap().unwrap();

        let mut got = String::new();
        peer_b.read_to_string(&mut got).unwrap();
        assert_eq!(got, "from a");
        got.clear();
        peer_a.read_to_string(&mut got).unwrap();
        assert_eq!(got, "from b");
        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(summary.final_eof, [EOF_ENDED, EOF_ENDED]);
        assert_eq!((summary.bytes_a_to_b, summary.bytes_b_to_a), (6, 6));
    }

    #[test]
    fn ignored_eof_keeps_polling_until_inactivity_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty");
        std::fs::write(&src, b"").unwrap();

        let mut a = reader("in", File::open(&src).unwrap());
        a.read_stream_mut().ignore_eof = true;
        let b = writer("out", File::create(dir.path().join("out")).unwrap());
        let config = config().with_total_timeout(Some(Duration::from_millis(200)));

        let started = Instant::now();
        let summary = TransferSession::new(a, b, &config).run().unwrap();

        assert_eq!(summary.outcome, Outcome::InactivityTimeout);
        assert!(summary.final_eof[0] < EOF_ENDED);
        assert!(summary.ignored_eofs >= 2, "{summary:?}");
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn child_exit_drains_leftover_data_first() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let (r, mut w) = pipe();
        w.write_all(b"0123456789").unwrap();

        let a = reader("child", r);
        let state = Arc::clone(a.read_stream().state());
        crate::reaper::ChildObserver::attached(&*state, 99);
        crate::reaper::ChildObserver::exited(&*state, &ChildExit::for_test(99));
        assert_eq!(state.eof(), EOF_CHILD_GONE);

        let b = writer("out", File::create(&dst).unwrap());
        // the writer stays open, so only the drain check can end the read side
        let summary = TransferSession::new(a, b, &config()).run().unwrap();
        drop(w);

        assert_eq!(summary.bytes_a_to_b, 10);
        assert_eq!(summary.final_eof[0], EOF_ENDED);
        assert_eq!(std::fs::read(&dst).unwrap(), b"0123456789");
    }

    #[test]
    fn escape_byte_truncates_and_ends_direction() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let (r, mut w) = pipe();
        w.write_all(b"ab\x1dcd").unwrap();

        let mut a = reader("in", r);
        a.read_stream_mut().escape = Some(0x1d);
        let b = writer("out", File::create(&dst).unwrap());
        let summary = TransferSession::new(a, b, &config()).run().unwrap();
        drop(w);

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(std::fs::read(&dst).unwrap(), b"ab");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn trace_sees_converted_block() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        std::fs::write(&src, b"a\nb\n").unwrap();

        let a = reader("in", File::open(&src).unwrap());
        let mut b = writer("out", File::create(dir.path().join("out")).unwrap());
        b.write_stream_mut().line_term = crate::endpoint::LineTerm::CrNl;

        let captured = Captured::default();
        let sink = TraceSink::new(crate::config::TraceMode::Text, Box::new(captured.clone()));
        TransferSession::new(a, b, &config())
            .with_trace_sink(sink)
            .run()
            .unwrap();

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("length=6 from=0 to=5"), "{text}");
        assert!(text.ends_with("a\\r\nb\\r\n"), "{text}");
    }

    #[test]
    fn timeout_rounds_up_to_whole_milliseconds() {
        assert_eq!(poll_timeout(Duration::from_micros(1)), PollTimeout::from(1u16));
        assert_eq!(poll_timeout(Duration::ZERO), PollTimeout::ZERO);
        assert_eq!(poll_timeout(Duration::from_secs(3600)), PollTimeout::from(u16::MAX));
    }
}
