//! The process's own standard streams.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;

use crate::direction::{DirMask, Direction};
use crate::endpoint::{ClosePolicy, Stream, StreamFds};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest, plain_shutdown};

const STDIN: i32 = 0;
const STDOUT: i32 = 1;
const STDERR: i32 = 2;

pub(super) static DESCS: &[AddressDesc] = &[
    AddressDesc {
        keyword: "STDIO",
        kind: DescKind::Endpoint,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_stdio,
        args: [STDIN, STDOUT, 0],
    },
    AddressDesc {
        keyword: "STDIN",
        kind: DescKind::Endpoint,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::READ,
        net_dirs: DirMask::empty(),
        open: open_stdio,
        args: [STDIN, -1, 0],
    },
    AddressDesc {
        keyword: "STDOUT",
        kind: DescKind::Endpoint,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::WRITE,
        net_dirs: DirMask::empty(),
        open: open_stdio,
        args: [-1, STDOUT, 0],
    },
    AddressDesc {
        keyword: "STDERR",
        kind: DescKind::Endpoint,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::WRITE,
        net_dirs: DirMask::empty(),
        open: open_stdio,
        args: [-1, STDERR, 0],
    },
];

/// `args[0]` is the read descriptor, `args[1]` the write descriptor.
fn open_stdio(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let [rfd, wfd, _] = req.args;
    let read = (req.direction.can_read() && rfd >= 0)
        .then(|| duplicate(rfd))
        .transpose()
        .map_err(|e| OpenError::from_io(format!("{}: dup({rfd})", req.keyword), e))?;
    let write = (req.direction.can_write() && wfd >= 0)
        .then(|| duplicate(wfd))
        .transpose()
        .map_err(|e| OpenError::from_io(format!("{}: dup({wfd})", req.keyword), e))?;

    let direction = Direction::from_parts(read.is_some(), write.is_some())
        .ok_or_else(|| OpenError::no_retry(format!("{}: cannot be opened {}", req.keyword, req.direction)))?;
    let fds = StreamFds::split(read, write);
    let shutdown = plain_shutdown(&fds);
    tracing::debug!(keyword = req.keyword, %direction, "using standard streams");
    Ok(Stream::new(req.keyword, fds, direction, shutdown, ClosePolicy::Close))
}

/// Work on a copy so closing never takes the process's own stream away.
fn duplicate(fd: i32) -> io::Result<File> {
    let owned = match fd {
        STDIN => io::stdin().as_fd().try_clone_to_owned()?,
        STDOUT => io::stdout().as_fd().try_clone_to_owned()?,
        _ => io::stderr().as_fd().try_clone_to_owned()?,
    };
    Ok(File::from(owned))
}
