//! Anonymous echo pipes and named pipes.

use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::Mode;

use crate::direction::{DirMask, Direction};
use crate::endpoint::{ClosePolicy, ShutdownAction, ShutdownPolicy, Stream, StreamFds};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest};

pub(super) static DESCS: &[AddressDesc] = &[AddressDesc {
    keyword: "PIPE",
    kind: DescKind::Endpoint,
    min_params: 0,
    max_params: 1,
    local_dirs: DirMask::ALL,
    net_dirs: DirMask::empty(),
    open: open_pipe,
    args: [0; 3],
}];

fn open_pipe(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    match req.params.first() {
        None => echo_pipe(&req),
        Some(path) => named_pipe(&req, Path::new(path)),
    }
}

/// Whatever is written comes back out on the read side.
fn echo_pipe(req: &OpenRequest<'_>) -> Result<Stream, OpenError> {
    let (read, write) = std::io::pipe().map_err(|e| OpenError::from_io("PIPE: pipe", e))?;
    let read = File::from(OwnedFd::from(read));
    let write = File::from(OwnedFd::from(write));
    let fds = match req.direction {
        Direction::ReadWrite => StreamFds::split(Some(read), Some(write)),
        Direction::Read => StreamFds::split(Some(read), None),
        Direction::Write => StreamFds::split(None, Some(write)),
    };
    tracing::debug!(
        read = fds.raw_read(),
        write = fds.raw_write(),
        "echo pipe created"
    );
    Ok(Stream::new(
        "PIPE",
        fds,
        req.direction,
        ShutdownPolicy::both(ShutdownAction::Close),
        ClosePolicy::Close,
    ))
}

fn named_pipe(req: &OpenRequest<'_>, path: &Path) -> Result<Stream, OpenError> {
    let name = format!("PIPE:{}", path.display());
    let mode = Mode::from_bits_truncate(req.options.mode.unwrap_or(0o666));
    match nix::unistd::mkfifo(path, mode) {
        Ok(()) => tracing::debug!(%name, "fifo created"),
        Err(Errno::EEXIST) => {}
        Err(e) => return Err(OpenError::from_io(format!("{name}: mkfifo"), e.into())),
    }

    // opening one side blocks until the fifo has a peer
    let file = OpenOptions::new()
        .read(req.direction.can_read())
        .write(req.direction.can_write())
        .open(path)
        .map_err(|e| OpenError::from_io(format!("{name}: open"), e))?;
    let fds = match req.direction {
        Direction::ReadWrite => StreamFds::Single(file),
        Direction::Read => StreamFds::split(Some(file), None),
        Direction::Write => StreamFds::split(None, Some(file)),
    };
    let mut stream = Stream::new(
        name,
        fds,
        req.direction,
        ShutdownPolicy::both(ShutdownAction::None),
        ClosePolicy::Close,
    );
    if req.options.unlink_close {
        stream = stream.with_unlink_on_close(path);
    }
    Ok(stream)
}
