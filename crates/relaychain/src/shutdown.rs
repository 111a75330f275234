//! Turning shutdown and close policies into concrete teardown.

use std::fs::File;
use std::io;
use std::net::Shutdown;
use std::os::fd::IntoRawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};
use nix::unistd::Pid;
use socket2::SockRef;

use crate::endpoint::{ClosePolicy, DataMethod, Endpoint, ShutdownAction, Stream, StreamFds, write_file};

const GRACE_STEP: Duration = Duration::from_millis(10);

/// Which halves to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

impl ShutdownHow {
    fn read(self) -> bool {
        matches!(self, ShutdownHow::Read | ShutdownHow::Both)
    }

    fn write(self) -> bool {
        matches!(self, ShutdownHow::Write | ShutdownHow::Both)
    }
}

#[derive(Debug, Clone, Copy)]
enum Half {
    Read,
    Write,
}

/// Shut down halves of an endpoint according to their policies.
///
/// Failures are logged; the relay carries on either way.
pub fn shutdown(endpoint: &mut Endpoint, how: ShutdownHow) {
    match endpoint {
        Endpoint::Single(stream) => shutdown_stream(stream, how),
        Endpoint::Dual { read, write } => {
            if how.read() {
                shutdown_stream(read, ShutdownHow::Read);
            }
            if how.write() {
                shutdown_stream(write, ShutdownHow::Write);
            }
        }
    }
}

fn shutdown_stream(stream: &mut Stream, how: ShutdownHow) {
    if stream.closed {
        tracing::debug!(stream = %stream.name, "shutdown on closed stream ignored");
        return;
    }
    if how.read() {
        let action = stream.shutdown.read;
        if let Err(e) = run_action(stream, action, Half::Read) {
            tracing::warn!(stream = %stream.name, ?action, error = %e, "read shutdown failed");
        }
    }
    if how.write() {
        let action = stream.shutdown.write;
        if let Err(e) = run_action(stream, action, Half::Write) {
            tracing::warn!(stream = %stream.name, ?action, error = %e, "write shutdown failed");
        }
    }
}

fn run_action(stream: &mut Stream, action: ShutdownAction, half: Half) -> io::Result<()> {
    tracing::debug!(stream = %stream.name, ?action, ?half, "shutdown");
    let file = match half {
        Half::Read => stream.fds.read_file(),
        Half::Write => stream.fds.write_file(),
    };

    match action {
        ShutdownAction::None => Ok(()),
        ShutdownAction::Close => {
            match half {
                Half::Read => stream.fds.close_read(),
                Half::Write => stream.fds.close_write(),
            }
            Ok(())
        }
        ShutdownAction::Down => {
            let Some(file) = file else { return Ok(()) };
            let how = match half {
                Half::Read => Shutdown::Read,
                Half::Write => Shutdown::Write,
            };
            match SockRef::from(file).shutdown(how) {
                Err(e) if e.raw_os_error() == Some(Errno::ENOTCONN as i32) => Ok(()),
                other => other,
            }
        }
        ShutdownAction::Signal { signal, grace } => {
            if let Some(grace) = grace {
                std::thread::sleep(grace);
            }
            signal_child(stream, signal)
        }
        ShutdownAction::PtyEof => match file {
            Some(file) => pty_eof(file),
            None => Ok(()),
        },
        ShutdownAction::Protocol => match (&mut stream.method, file) {
            (DataMethod::Record(layer), Some(file)) => layer.shutdown(file),
            _ => Ok(()),
        },
        ShutdownAction::NullPacket => match file {
            Some(file) => SockRef::from(file).send(&[]).map(|_| ()),
            None => Ok(()),
        },
    }
}

/// Switch the terminal to canonical mode and send its EOF character.
fn pty_eof(file: &File) -> io::Result<()> {
    let mut attrs = termios::tcgetattr(file)?;
    attrs.local_flags.insert(LocalFlags::ICANON);
    termios::tcsetattr(file, SetArg::TCSADRAIN, &attrs)?;
    let eof = attrs.control_chars[SpecialCharacterIndices::VEOF as usize];
    write_file(file, &[eof]).map(|_| ())
}

fn signal_child(stream: &Stream, signal: Signal) -> io::Result<()> {
    let Some(pid) = stream.state.child_pid() else {
        tracing::trace!(stream = %stream.name, ?signal, "no child to signal");
        return Ok(());
    };
    tracing::debug!(stream = %stream.name, pid, ?signal, "signalling child");
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Close an endpoint for good.
///
/// All descriptors of the endpoint are released before any hop task is
/// joined, so the task sees end of file on both directions. Closing twice
/// is a logged no-op.
pub fn close(endpoint: &mut Endpoint) {
    match endpoint {
        Endpoint::Single(stream) => {
            close_fds(stream);
            finish(stream);
        }
        Endpoint::Dual { read, write } => {
            close_fds(read);
            close_fds(write);
            finish(read);
            finish(write);
        }
    }
}

fn close_fds(stream: &mut Stream) {
    if stream.closed {
        tracing::debug!(stream = %stream.name, "already closed");
        return;
    }
    tracing::debug!(stream = %stream.name, policy = ?stream.close, "closing");
    restore_tty(stream);

    let result = match stream.close {
        ClosePolicy::None => {
            leave_open(stream);
            Ok(())
        }
        ClosePolicy::Close => {
            stream.fds = StreamFds::Closed;
            Ok(())
        }
        ClosePolicy::Signal(signal) => {
            let r = signal_child(stream, signal);
            stream.fds = StreamFds::Closed;
            r
        }
        ClosePolicy::CloseThenSignal(signal) => {
            stream.fds = StreamFds::Closed;
            signal_child(stream, signal)
        }
        ClosePolicy::SleepThenSignal(signal, grace) => {
            stream.fds = StreamFds::Closed;
            sleep_then_signal(stream, signal, grace)
        }
        ClosePolicy::Protocol => {
            let r = match (&mut stream.method, stream.fds.write_file()) {
                (DataMethod::Record(layer), Some(file)) => layer.close(file),
                _ => Ok(()),
            };
            stream.fds = StreamFds::Closed;
            r
        }
    };
    if let Err(e) = result {
        tracing::warn!(stream = %stream.name, error = %e, "close failed");
    }
}

/// Give the child up to `grace` to exit on its own, then signal it.
fn sleep_then_signal(stream: &Stream, signal: Signal, grace: Duration) -> io::Result<()> {
    let deadline = Instant::now() + grace;
    while stream.state.child_pid().is_some() && Instant::now() < deadline {
        std::thread::sleep(GRACE_STEP);
    }
    signal_child(stream, signal)
}

fn leave_open(stream: &mut Stream) {
    match std::mem::replace(&mut stream.fds, StreamFds::Closed) {
        StreamFds::Closed => {}
        StreamFds::Single(file) => {
            let _ = file.into_raw_fd();
        }
        StreamFds::Split { read, write } => {
            for file in [read, write].into_iter().flatten() {
                let _ = file.into_raw_fd();
            }
        }
    }
}

fn restore_tty(stream: &mut Stream) {
    let Some(saved) = stream.saved_tty.take() else { return };
    let Some(file) = stream.fds.read_file().or(stream.fds.write_file()) else {
        return;
    };
    if let Err(e) = termios::tcsetattr(file, SetArg::TCSADRAIN, &saved) {
        tracing::warn!(stream = %stream.name, error = %e, "restoring terminal mode failed");
    }
}

fn finish(stream: &mut Stream) {
    if stream.closed {
        return;
    }
    stream.closed = true;
    stream.lock = None;
    if let Some(path) = stream.unlink_on_close.take() {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "unlinked"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "unlink on close failed"),
        }
    }
    if let Some(task) = stream.task.take() {
        task.join();
    }
}
