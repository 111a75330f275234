//! Local channels that connect an intermediate hop to its task.
//!
//! The left end goes back to whoever opened the hop, the right end to the
//! hop's engine. Which primitive is used comes from [`CommKind`].

use std::fs::{File, OpenOptions};
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};

use crate::config::CommKind;
use crate::direction::Direction;
use crate::endpoint::{ClosePolicy, DataMethod, ShutdownAction, ShutdownPolicy, Stream, StreamFds};

/// One end of a comm pair with the policies that fit its primitive.
#[derive(Debug)]
pub struct PairEnd {
    pub fds: StreamFds,
    pub pty: bool,
    pub shutdown: ShutdownPolicy,
    pub close: ClosePolicy,
}

impl PairEnd {
    fn new(fds: StreamFds, kind: CommKind) -> Self {
        let (shutdown, close) = match kind {
            CommKind::SocketPairs | CommKind::SocketPair | CommKind::Tcp => {
                (ShutdownPolicy::socket(), ClosePolicy::Close)
            }
            CommKind::Pipes => (ShutdownPolicy::both(ShutdownAction::Close), ClosePolicy::Close),
            CommKind::Ptys | CommKind::Pty => (
                ShutdownPolicy::new(ShutdownAction::None, ShutdownAction::PtyEof),
                ClosePolicy::Close,
            ),
        };
        Self {
            fds,
            pty: matches!(kind, CommKind::Ptys | CommKind::Pty),
            shutdown,
            close,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_parts(self.fds.read_file().is_some(), self.fds.write_file().is_some())
    }

    /// Wrap the descriptors as a plain stream.
    pub fn into_stream(self, name: impl Into<String>) -> Stream {
        let direction = self.direction().unwrap_or(Direction::ReadWrite);
        let method = if self.pty { DataMethod::Pty } else { DataMethod::Stream };
        Stream::new(name, self.fds, direction, self.shutdown, self.close).with_method(method)
    }

    /// Split into a read-only and a write-only end.
    pub fn split(self) -> io::Result<(PairEnd, PairEnd)> {
        let (read, write) = self.fds.into_halves()?;
        let half = |fds| PairEnd {
            fds,
            pty: self.pty,
            shutdown: self.shutdown,
            close: self.close,
        };
        Ok((half(StreamFds::split(read, None)), half(StreamFds::split(None, write))))
    }
}

#[derive(Debug)]
pub struct CommPair {
    pub left: PairEnd,
    pub right: PairEnd,
}

/// Create a channel carrying the requested directions.
///
/// With `dual`, single-descriptor primitives are duplicated so reading and
/// writing use different descriptors.
pub fn open(kind: CommKind, left_to_right: bool, right_to_left: bool, dual: bool) -> io::Result<CommPair> {
    let (left, right) = match kind {
        CommKind::SocketPairs => {
            let lr = left_to_right.then(half_closed_socketpair).transpose()?;
            let rl = right_to_left.then(half_closed_socketpair).transpose()?;
            split_pairs(lr, rl)
        }
        CommKind::Pipes => {
            let lr = left_to_right.then(pipe).transpose()?;
            let rl = right_to_left.then(pipe).transpose()?;
            split_pairs(lr, rl)
        }
        CommKind::Ptys => {
            let lr = left_to_right.then(raw_pty).transpose()?;
            let rl = right_to_left.then(raw_pty).transpose()?;
            split_pairs(lr, rl)
        }
        CommKind::SocketPair => {
            let (a, b) = UnixStream::pair()?;
            (single(b), single(a))
        }
        CommKind::Pty => {
            let (tty, master) = raw_pty()?;
            (StreamFds::Single(master), StreamFds::Single(tty))
        }
        CommKind::Tcp => {
            let (a, b) = loopback_pair()?;
            (single(a), single(b))
        }
    };

    let mut left = PairEnd::new(left, kind);
    let mut right = PairEnd::new(right, kind);
    if kind == CommKind::Pty {
        right.shutdown = ShutdownPolicy::both(ShutdownAction::Close);
    }
    if dual {
        left.fds = dualize(left.fds)?;
        right.fds = dualize(right.fds)?;
    }
    tracing::trace!(
        ?kind,
        left_read = left.fds.raw_read(),
        left_write = left.fds.raw_write(),
        right_read = right.fds.raw_read(),
        right_write = right.fds.raw_write(),
        "comm pair created"
    );
    Ok(CommPair { left, right })
}

fn dualize(fds: StreamFds) -> io::Result<StreamFds> {
    match fds {
        StreamFds::Single(_) => {
            let (read, write) = fds.into_halves()?;
            Ok(StreamFds::split(read, write))
        }
        other => Ok(other),
    }
}

fn single(fd: impl Into<OwnedFd>) -> StreamFds {
    StreamFds::Single(File::from(fd.into()))
}

/// Assemble two one-way channels, each given as (reading end, writing end).
fn split_pairs(lr: Option<(File, File)>, rl: Option<(File, File)>) -> (StreamFds, StreamFds) {
    let (right_read, left_write) = lr.unzip();
    let (left_read, right_write) = rl.unzip();
    (
        StreamFds::split(left_read, left_write),
        StreamFds::split(right_read, right_write),
    )
}

/// A socketpair where the reading end can no longer send.
fn half_closed_socketpair() -> io::Result<(File, File)> {
    let (read, write) = UnixStream::pair()?;
    read.shutdown(Shutdown::Write)?;
    Ok((File::from(OwnedFd::from(read)), File::from(OwnedFd::from(write))))
}

pub(crate) fn pipe() -> io::Result<(File, File)> {
    let (read, write) = std::io::pipe()?;
    Ok((File::from(OwnedFd::from(read)), File::from(OwnedFd::from(write))))
}

/// A pseudo-terminal in raw mode, as (terminal, master).
pub(crate) fn raw_pty() -> io::Result<(File, File)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let name = ptsname_r(&master)?;
    let tty = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(&name)?;

    let mut raw = termios::tcgetattr(&tty)?;
    termios::cfmakeraw(&mut raw);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(&tty, SetArg::TCSANOW, &raw)?;

    // Safety: into_raw_fd hands over sole ownership of a valid descriptor.
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    tracing::debug!(pty = %name, "pty created");
    Ok((tty, master))
}

/// Connected loopback TCP sockets, checking the accepted peer is ours.
fn loopback_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let connector = TcpStream::connect(listener.local_addr()?)?;
    let expected = connector.local_addr()?;
    loop {
        let (accepted, peer) = listener.accept()?;
        if peer == expected {
            connector.set_nodelay(true)?;
            accepted.set_nodelay(true)?;
            return Ok((connector, accepted));
        }
        tracing::warn!(%peer, "unexpected connection on loopback pair, dropped");
    }
}
