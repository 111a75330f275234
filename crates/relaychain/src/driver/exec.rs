//! Child processes connected through a socketpair, pipes or a pty.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Stdio;

use nix::sys::signal::Signal;
use tokio::process::Command;

use crate::commpair;
use crate::direction::{DirMask, Direction};
use crate::endpoint::{CHILD_GRACE, ClosePolicy, DataMethod, ShutdownAction, ShutdownPolicy, Stream, StreamFds, StreamState};
use crate::error::OpenError;

use super::{AddressDesc, Caps, DescKind, OpenRequest};

const EXEC: i32 = 0;
const SYSTEM: i32 = 1;

pub(super) static DESCS: &[AddressDesc] = &[
    AddressDesc {
        keyword: "EXEC",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_child,
        args: [EXEC, 0, 0],
    },
    AddressDesc {
        keyword: "SYSTEM",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_child,
        args: [SYSTEM, 0, 0],
    },
];

/// Our side of the channel plus what the child gets as stdin and stdout.
struct Wiring {
    fds: StreamFds,
    method: DataMethod,
    write_shutdown: ShutdownAction,
    child_in: Option<OwnedFd>,
    child_out: Option<OwnedFd>,
}

fn open_child(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    if !req.caps.contains(Caps::MAY_EXEC | Caps::MAY_CHILD) {
        return Err(OpenError::no_retry(format!("{}: child processes not allowed here", req.keyword)));
    }
    let reaper = req
        .env
        .reaper
        .as_ref()
        .ok_or_else(|| OpenError::no_retry(format!("{}: no reaper running", req.keyword)))?;
    let line = req.param(0)?;
    let mut cmd = command(req.args[0], line)
        .ok_or_else(|| OpenError::no_retry(format!("{}: empty command line", req.keyword)))?;

    let io_err = |what: &str, e: io::Error| OpenError::from_io(format!("{}: {what}", req.keyword), e);
    let wiring = wire(req.direction, req.options.pipes, req.options.pty).map_err(|e| io_err("channel", e))?;

    let child_out_dup = match (&wiring.child_out, req.options.stderr) {
        (Some(out), true) => Some(out.try_clone().map_err(|e| io_err("dup", e))?),
        _ => None,
    };
    cmd.stdin(wiring.child_in.map_or_else(Stdio::null, Stdio::from));
    cmd.stdout(wiring.child_out.map_or_else(Stdio::null, Stdio::from));
    if let Some(err) = child_out_dup {
        cmd.stderr(Stdio::from(err));
    }

    let state = StreamState::new();
    let pid = reaper
        .spawn_child(&mut cmd, state.clone())
        .map_err(|e| io_err("spawn", e))?;
    // the command still owns the child's ends of the channel
    drop(cmd);
    tracing::info!(keyword = req.keyword, pid, command = line, "child started");

    let shutdown = ShutdownPolicy::new(ShutdownAction::None, wiring.write_shutdown);
    Ok(Stream::new(
        format!("{}:{line}", req.keyword),
        wiring.fds,
        req.direction,
        shutdown,
        close_policy(req.direction),
    )
    .with_method(wiring.method)
    .with_state(state))
}

/// A child we read from is told to stop once its output is closed. A child
/// we only feed gets a moment to drain its input first.
fn close_policy(direction: Direction) -> ClosePolicy {
    if direction.can_read() {
        ClosePolicy::CloseThenSignal(Signal::SIGTERM)
    } else {
        ClosePolicy::SleepThenSignal(Signal::SIGTERM, CHILD_GRACE)
    }
}

fn command(kind: i32, line: &str) -> Option<Command> {
    if kind == SYSTEM {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(line);
        return Some(cmd);
    }
    let mut words = line.split_whitespace();
    let mut cmd = Command::new(words.next()?);
    cmd.args(words);
    Some(cmd)
}

fn wire(direction: Direction, pipes: bool, pty: bool) -> io::Result<Wiring> {
    if pty {
        let (tty, master) = commpair::raw_pty()?;
        let tty = OwnedFd::from(tty);
        let child_in = direction.can_write().then(|| tty.try_clone()).transpose()?;
        let child_out = direction.can_read().then_some(tty);
        return Ok(Wiring {
            fds: StreamFds::Single(master),
            method: DataMethod::Pty,
            write_shutdown: ShutdownAction::PtyEof,
            child_in,
            child_out,
        });
    }

    if pipes {
        let to_child = direction.can_write().then(commpair::pipe).transpose()?;
        let from_child = direction.can_read().then(commpair::pipe).transpose()?;
        let (child_in, ours_w) = to_child.unzip();
        let (ours_r, child_out) = from_child.unzip();
        return Ok(Wiring {
            fds: StreamFds::split(ours_r, ours_w),
            method: DataMethod::Stream,
            write_shutdown: ShutdownAction::Close,
            child_in: child_in.map(OwnedFd::from),
            child_out: child_out.map(OwnedFd::from),
        });
    }

    let (ours, theirs) = UnixStream::pair()?;
    let theirs = OwnedFd::from(theirs);
    let child_in = direction.can_write().then(|| theirs.try_clone()).transpose()?;
    let child_out = direction.can_read().then_some(theirs);
    let ours = File::from(OwnedFd::from(ours));
    let fds = match direction {
        Direction::ReadWrite => StreamFds::Single(ours),
        Direction::Read => StreamFds::split(Some(ours), None),
        Direction::Write => StreamFds::split(None, Some(ours)),
    };
    Ok(Wiring {
        fds,
        method: DataMethod::Stream,
        write_shutdown: ShutdownAction::Down,
        child_in,
        child_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_splits_words_system_uses_shell() {
        let exec = command(EXEC, "cat -u  -").unwrap();
        let std = exec.as_std();
        assert_eq!(std.get_program(), "cat");
        assert_eq!(std.get_args().collect::<Vec<_>>(), ["-u", "-"]);

        let system = command(SYSTEM, "echo a | tr a b").unwrap();
        assert_eq!(system.as_std().get_program(), "/bin/sh");
        assert!(command(EXEC, "   ").is_none());
    }

    #[test]
    fn write_only_child_gets_time_to_drain() {
        assert_eq!(
            close_policy(Direction::ReadWrite),
            ClosePolicy::CloseThenSignal(Signal::SIGTERM)
        );
        assert_eq!(
            close_policy(Direction::Write),
            ClosePolicy::SleepThenSignal(Signal::SIGTERM, CHILD_GRACE)
        );
    }

    #[test]
    fn pipes_wiring_uses_separate_descriptors() {
        let wiring = wire(Direction::ReadWrite, true, false).unwrap();
        assert!(matches!(wiring.fds, StreamFds::Split { .. }));
        assert_ne!(wiring.fds.raw_read(), wiring.fds.raw_write());
        assert_eq!(wiring.write_shutdown, ShutdownAction::Close);
    }

    #[test]
    fn read_only_child_gets_no_stdin() {
        let wiring = wire(Direction::Read, false, false).unwrap();
        assert!(wiring.child_in.is_none());
        assert!(wiring.child_out.is_some());
        assert_eq!(wiring.fds.raw_write(), -1);
    }
}
