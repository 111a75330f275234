//! Endpoints: the descriptors, policies and state the engine works on.
//!
//! A [`Stream`] is one independently driven channel. An [`Endpoint`] is
//! either a single stream used in both directions or a dual pair where one
//! stream is read and the other written.

pub mod policy;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::thread::JoinHandle;

use nix::sys::termios::{self, SetArg, Termios};

use crate::address::AddressOptions;
use crate::direction::Direction;
use crate::lockfile::LockFile;
use crate::reaper::{ChildExit, ChildObserver};

pub use policy::{CHILD_GRACE, ClosePolicy, ShutdownAction, ShutdownPolicy};

/// End-of-file levels.
pub const EOF_OPEN: u8 = 0;
/// The process behind the stream is gone but may have left data behind.
pub const EOF_CHILD_GONE: u8 = 1;
pub const EOF_ENDED: u8 = 2;

/// Closing levels.
pub const CLOSING_NONE: u8 = 0;
/// One side reached eof and the peer's write side was shut down.
pub const CLOSING_HALF: u8 = 1;
/// The close-grace timer is running.
pub const CLOSING_GRACE: u8 = 2;
pub const CLOSING_FULL: u8 = 3;

/// Line terminator convention of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineTerm {
    #[default]
    Raw,
    Cr,
    CrNl,
}

/// Protocol layer with its own framing on top of the descriptors.
pub trait RecordLayer: Send + fmt::Debug {
    fn read(&mut self, file: &File, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, file: &File, data: &[u8]) -> io::Result<usize>;

    /// Bytes already decoded and waiting to be read.
    fn pending(&self) -> usize {
        0
    }

    /// Protocol-level half-close.
    fn shutdown(&mut self, file: &File) -> io::Result<()> {
        let _ = file;
        Ok(())
    }

    /// Protocol-level session end, before the descriptors are closed.
    fn close(&mut self, file: &File) -> io::Result<()> {
        self.shutdown(file)
    }
}

/// How bytes move through a stream.
#[derive(Debug)]
pub enum DataMethod {
    Stream,
    /// Pseudo-terminal master or slave: EIO on read means the other side hung up.
    Pty,
    Record(Box<dyn RecordLayer>),
    /// Writes the given marker byte after every block.
    Test(u8),
}

/// Descriptor ownership of a stream.
#[derive(Debug)]
pub enum StreamFds {
    Closed,
    /// One descriptor used for both reading and writing.
    Single(File),
    Split {
        read: Option<File>,
        write: Option<File>,
    },
}

impl StreamFds {
    pub fn split(read: Option<File>, write: Option<File>) -> Self {
        match (read, write) {
            (None, None) => StreamFds::Closed,
            (read, write) => StreamFds::Split { read, write },
        }
    }

    pub fn read_file(&self) -> Option<&File> {
        match self {
            StreamFds::Closed => None,
            StreamFds::Single(f) => Some(f),
            StreamFds::Split { read, .. } => read.as_ref(),
        }
    }

    pub fn write_file(&self) -> Option<&File> {
        match self {
            StreamFds::Closed => None,
            StreamFds::Single(f) => Some(f),
            StreamFds::Split { write, .. } => write.as_ref(),
        }
    }

    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.read_file().map(|f| f.as_fd())
    }

    pub fn write_fd(&self) -> Option<BorrowedFd<'_>> {
        self.write_file().map(|f| f.as_fd())
    }

    pub fn raw_read(&self) -> RawFd {
        self.read_file().map_or(-1, |f| f.as_raw_fd())
    }

    pub fn raw_write(&self) -> RawFd {
        self.write_file().map_or(-1, |f| f.as_raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        match self {
            StreamFds::Closed => true,
            StreamFds::Single(_) => false,
            StreamFds::Split { read, write } => read.is_none() && write.is_none(),
        }
    }

    /// Split into per-direction descriptors, duplicating a single one.
    pub fn into_halves(self) -> io::Result<(Option<File>, Option<File>)> {
        match self {
            StreamFds::Closed => Ok((None, None)),
            StreamFds::Single(f) => Ok((Some(f.try_clone()?), Some(f))),
            StreamFds::Split { read, write } => Ok((read, write)),
        }
    }

    /// Drop the read descriptor. A single descriptor goes away entirely.
    pub fn close_read(&mut self) {
        match self {
            StreamFds::Split { read, .. } => *read = None,
            _ => *self = StreamFds::Closed,
        }
    }

    pub fn close_write(&mut self) {
        match self {
            StreamFds::Split { write, .. } => *write = None,
            _ => *self = StreamFds::Closed,
        }
    }
}

/// State shared between the engine and the reaper.
///
/// Both levels only ever move upward.
#[derive(Debug, Default)]
pub struct StreamState {
    eof: AtomicU8,
    closing: AtomicU8,
    child: AtomicU32,
}

impl StreamState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn eof(&self) -> u8 {
        self.eof.load(Ordering::Acquire)
    }

    pub fn closing(&self) -> u8 {
        self.closing.load(Ordering::Acquire)
    }

    pub fn raise_eof(&self, level: u8) {
        self.eof.fetch_max(level, Ordering::AcqRel);
    }

    pub fn raise_closing(&self, level: u8) {
        self.closing.fetch_max(level, Ordering::AcqRel);
    }

    /// Move `closing` from `from` to `to`, returning whether this call did it.
    pub fn advance_closing(&self, from: u8, to: u8) -> bool {
        self.closing
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn child_pid(&self) -> Option<u32> {
        match self.child.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn link_child(&self, pid: u32) {
        self.child.store(pid, Ordering::Release);
    }

    pub fn unlink_child(&self) -> Option<u32> {
        match self.child.swap(0, Ordering::AcqRel) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl ChildObserver for StreamState {
    fn attached(&self, pid: u32) {
        self.link_child(pid);
    }

    fn exited(&self, exit: &ChildExit) {
        self.unlink_child();
        if self.closing() > CLOSING_NONE {
            return;
        }
        tracing::debug!(pid = exit.pid, "child of stream exited, checking for leftover data");
        self.raise_eof(EOF_CHILD_GONE);
    }
}

/// Task running the engine of an intermediate hop.
pub struct HopTask {
    name: String,
    handle: JoinHandle<()>,
}

impl HopTask {
    pub fn new(name: String, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn join(self) {
        tracing::debug!(hop = %self.name, "joining hop task");
        if self.handle.join().is_err() {
            tracing::error!(hop = %self.name, "hop task panicked");
        }
    }
}

impl fmt::Debug for HopTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopTask").field("name", &self.name).finish()
    }
}

/// One channel with its descriptors, policies and engine-visible state.
#[derive(Debug)]
pub struct Stream {
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) fds: StreamFds,
    pub(crate) method: DataMethod,
    pub(crate) shutdown: ShutdownPolicy,
    pub(crate) close: ClosePolicy,
    pub(crate) state: Arc<StreamState>,
    pub(crate) ignore_eof: bool,
    pub(crate) escape: Option<u8>,
    pub(crate) escape_seen: bool,
    pub(crate) line_term: LineTerm,
    /// Remaining bytes allowed by a read limit.
    pub(crate) read_limit: Option<usize>,
    pub(crate) unlink_on_close: Option<PathBuf>,
    pub(crate) saved_tty: Option<Termios>,
    pub(crate) lock: Option<LockFile>,
    pub(crate) task: Option<HopTask>,
    pub(crate) closed: bool,
}

impl Stream {
    /// Every driver states both policies up front.
    pub fn new(
        name: impl Into<String>,
        fds: StreamFds,
        direction: Direction,
        shutdown: ShutdownPolicy,
        close: ClosePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            fds,
            method: DataMethod::Stream,
            shutdown,
            close,
            state: StreamState::new(),
            ignore_eof: false,
            escape: None,
            escape_seen: false,
            line_term: LineTerm::Raw,
            read_limit: None,
            unlink_on_close: None,
            saved_tty: None,
            lock: None,
            task: None,
            closed: false,
        }
    }

    pub fn with_method(mut self, method: DataMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_state(mut self, state: Arc<StreamState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_unlink_on_close(mut self, path: impl Into<PathBuf>) -> Self {
        self.unlink_on_close = Some(path.into());
        self
    }

    pub fn with_lock(mut self, lock: LockFile) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    pub fn fds(&self) -> &StreamFds {
        &self.fds
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.shutdown
    }

    pub fn close_policy(&self) -> ClosePolicy {
        self.close
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_policies(&mut self, shutdown: ShutdownPolicy, close: ClosePolicy) {
        self.shutdown = shutdown;
        self.close = close;
    }

    /// Apply the engine-related address options.
    pub fn apply_options(&mut self, opts: &AddressOptions) -> io::Result<()> {
        self.ignore_eof |= opts.ignore_eof;
        if opts.escape.is_some() {
            self.escape = opts.escape;
        }
        if opts.line_term != LineTerm::Raw {
            self.line_term = opts.line_term;
        }
        if opts.read_bytes.is_some() {
            self.read_limit = opts.read_bytes;
        }
        if let Some(action) = opts.shut {
            self.shutdown.write = action;
        }
        if let Some(close) = opts.close {
            self.close = close;
        }
        if opts.raw {
            self.make_raw()?;
        }
        Ok(())
    }

    /// Put the terminal into raw mode, remembering the previous settings.
    fn make_raw(&mut self) -> io::Result<()> {
        let Some(file) = self.fds.read_file().or(self.fds.write_file()) else {
            return Ok(());
        };
        let saved = match termios::tcgetattr(file) {
            Ok(t) => t,
            Err(nix::errno::Errno::ENOTTY) => {
                tracing::warn!(stream = %self.name, "raw: not a terminal, ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(file, SetArg::TCSADRAIN, &raw)?;
        if self.saved_tty.is_none() {
            self.saved_tty = Some(saved);
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        match &self.method {
            DataMethod::Record(layer) => layer.pending(),
            _ => 0,
        }
    }

    /// Read one block, honoring the read limit.
    pub fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = match self.read_limit {
            Some(0) => return Ok(0),
            Some(left) => left.min(buf.len()),
            None => buf.len(),
        };
        let file = self
            .fds
            .read_file()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no read descriptor"))?;
        let n = match &mut self.method {
            DataMethod::Stream | DataMethod::Test(_) => read_file(file, &mut buf[..len])?,
            DataMethod::Pty => match read_file(file, &mut buf[..len]) {
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => 0,
                other => other?,
            },
            DataMethod::Record(layer) => layer.read(file, &mut buf[..len])?,
        };
        if let Some(left) = self.read_limit.as_mut() {
            *left -= n;
        }
        Ok(n)
    }

    pub fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        let file = self
            .fds
            .write_file()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no write descriptor"))?;
        match &mut self.method {
            DataMethod::Stream | DataMethod::Pty => write_file(file, data),
            DataMethod::Record(layer) => layer.write(file, data),
            DataMethod::Test(marker) => {
                let n = write_file(file, data)?;
                write_file(file, &[*marker])?;
                Ok(n)
            }
        }
    }
}

pub(crate) fn read_file(mut file: &File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) fn write_file(mut file: &File, data: &[u8]) -> io::Result<usize> {
    loop {
        match file.write(data) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// One side of a relay.
#[derive(Debug)]
pub enum Endpoint {
    Single(Stream),
    Dual { read: Box<Stream>, write: Box<Stream> },
}

impl Endpoint {
    pub fn dual(read: Stream, write: Stream) -> Self {
        Endpoint::Dual {
            read: Box::new(read),
            write: Box::new(write),
        }
    }

    pub fn read_stream(&self) -> &Stream {
        match self {
            Endpoint::Single(s) => s,
            Endpoint::Dual { read, .. } => read,
        }
    }

    pub fn read_stream_mut(&mut self) -> &mut Stream {
        match self {
            Endpoint::Single(s) => s,
            Endpoint::Dual { read, .. } => read,
        }
    }

    pub fn write_stream(&self) -> &Stream {
        match self {
            Endpoint::Single(s) => s,
            Endpoint::Dual { write, .. } => write,
        }
    }

    pub fn write_stream_mut(&mut self) -> &mut Stream {
        match self {
            Endpoint::Single(s) => s,
            Endpoint::Dual { write, .. } => write,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Endpoint::Single(s) => s.direction,
            Endpoint::Dual { read, write } => {
                Direction::from_parts(read.direction.can_read(), write.direction.can_write())
                    .unwrap_or(Direction::ReadWrite)
            }
        }
    }

    pub fn is_readable(&self) -> bool {
        self.direction().can_read()
    }

    pub fn is_writable(&self) -> bool {
        self.direction().can_write()
    }

    pub fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_stream_mut().read_block(buf)
    }

    pub fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_stream_mut().write_block(data)
    }

    /// Hand a hop task to this endpoint; it is joined when the endpoint closes.
    pub fn attach_task(&mut self, task: HopTask) {
        self.read_stream_mut().task = Some(task);
    }

    pub fn describe(&self) -> String {
        match self {
            Endpoint::Single(s) => format!("{} (fd {}/{})", s.name, s.fds.raw_read(), s.fds.raw_write()),
            Endpoint::Dual { read, write } => format!(
                "{}%{} (fd {}/{})",
                write.name,
                read.name,
                read.fds.raw_read(),
                write.fds.raw_write()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_stream() -> (Stream, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        let stream = Stream::new(
            "test",
            StreamFds::split(Some(File::from(r)), None),
            Direction::Read,
            ShutdownPolicy::both(ShutdownAction::Close),
            ClosePolicy::Close,
        );
        (stream, File::from(w))
    }

    #[test]
    fn levels_never_decrease() {
        let state = StreamState::default();
        state.raise_eof(2);
        state.raise_eof(1);
        assert_eq!(state.eof(), 2);
        state.raise_closing(3);
        assert!(!state.advance_closing(1, 2));
        assert_eq!(state.closing(), 3);
    }

    #[test]
    fn child_exit_marks_eof_once_linked() {
        let state = StreamState::default();
        state.attached(42);
        assert_eq!(state.child_pid(), Some(42));
        state.exited(&ChildExit::for_test(42));
        assert_eq!(state.child_pid(), None);
        assert_eq!(state.eof(), EOF_CHILD_GONE);
    }

    #[test]
    fn child_exit_while_closing_leaves_eof() {
        let state = StreamState::default();
        state.attached(7);
        state.raise_closing(CLOSING_HALF);
        state.exited(&ChildExit::for_test(7));
        assert_eq!(state.child_pid(), None);
        assert_eq!(state.eof(), EOF_OPEN);
    }

    #[test]
    fn read_limit_caps_total_bytes() {
        let (mut stream, mut w) = pipe_stream();
        stream.read_limit = Some(3);
        w.write_all(b"abcdef").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read_block(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(stream.read_block(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_method_appends_marker() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut stream = Stream::new(
            "test",
            StreamFds::split(None, Some(File::from(w))),
            Direction::Write,
            ShutdownPolicy::both(ShutdownAction::Close),
            ClosePolicy::Close,
        )
        .with_method(DataMethod::Test(b'>'));
        assert_eq!(stream.write_block(b"hi").unwrap(), 2);
        drop(stream);
        let mut out = String::new();
        File::from(r).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi>");
    }

    #[test]
    fn single_fds_split_into_independent_halves() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fds = StreamFds::Single(File::from(std::os::fd::OwnedFd::from(a)));
        let (read, write) = fds.into_halves().unwrap();
        let (read, write) = (read.unwrap(), write.unwrap());
        assert_ne!(read.as_raw_fd(), write.as_raw_fd());
    }

    #[test]
    fn raw_option_saves_and_close_restores_terminal_mode() {
        use nix::sys::termios::LocalFlags;

        let (tty, _master) = crate::commpair::raw_pty().unwrap();
        let mut cooked = termios::tcgetattr(&tty).unwrap();
        cooked.local_flags.insert(LocalFlags::ICANON | LocalFlags::ECHO);
        termios::tcsetattr(&tty, SetArg::TCSANOW, &cooked).unwrap();

        let mut stream = Stream::new(
            "tty",
            StreamFds::Single(tty.try_clone().unwrap()),
            Direction::ReadWrite,
            ShutdownPolicy::both(ShutdownAction::None),
            ClosePolicy::Close,
        );
        let opts = AddressOptions {
            raw: true,
            ..AddressOptions::default()
        };
        stream.apply_options(&opts).unwrap();
        let flags = termios::tcgetattr(&tty).unwrap().local_flags;
        assert!(!flags.contains(LocalFlags::ICANON));

        crate::shutdown::close(&mut Endpoint::Single(stream));
        let flags = termios::tcgetattr(&tty).unwrap().local_flags;
        assert!(flags.contains(LocalFlags::ICANON | LocalFlags::ECHO));
    }

    #[test]
    fn teardown_options_override_driver_policies() {
        let (mut stream, _w) = pipe_stream();
        let opts = AddressOptions {
            shut: Some(ShutdownAction::NullPacket),
            close: Some(ClosePolicy::None),
            ..AddressOptions::default()
        };
        stream.apply_options(&opts).unwrap();
        assert_eq!(stream.shutdown_policy().write, ShutdownAction::NullPacket);
        assert_eq!(stream.shutdown_policy().read, ShutdownAction::Close);
        assert_eq!(stream.close_policy(), ClosePolicy::None);
    }
}
