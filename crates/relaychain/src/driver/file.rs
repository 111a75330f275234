//! Files and other filesystem nodes opened by path.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::os::fd::OwnedFd;
use std::path::Path;

use crate::direction::{DirMask, Direction};
use crate::endpoint::{ClosePolicy, ShutdownAction, ShutdownPolicy, Stream, StreamFds};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest};

const OPEN: i32 = 0;
const CREATE: i32 = 1;
const GOPEN: i32 = 2;

pub(super) static DESCS: &[AddressDesc] = &[
    AddressDesc {
        keyword: "OPEN",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_path,
        args: [OPEN, 0, 0],
    },
    AddressDesc {
        keyword: "CREATE",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::WRITE,
        net_dirs: DirMask::empty(),
        open: open_path,
        args: [CREATE, 0, 0],
    },
    AddressDesc {
        keyword: "GOPEN",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_path,
        args: [GOPEN, 0, 0],
    },
];

fn open_path(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let path = Path::new(req.param(0)?);
    let opts = req.options;
    let mode = req.args[0];
    let name = format!("{}:{}", req.keyword, path.display());

    // GOPEN on an existing socket connects to it
    if mode == GOPEN && is_socket(path) {
        let sock = UnixStream::connect(path).map_err(|e| OpenError::from_io(format!("{name}: connect"), e))?;
        let fds = StreamFds::Single(File::from(OwnedFd::from(sock)));
        return Ok(Stream::new(
            name,
            fds,
            Direction::ReadWrite,
            ShutdownPolicy::socket(),
            ClosePolicy::Close,
        ));
    }

    let mut open = OpenOptions::new();
    open.read(req.direction.can_read())
        .write(req.direction.can_write())
        .append(opts.append);
    if req.direction.can_write() {
        let create = mode == CREATE || mode == GOPEN || opts.creat;
        open.create(create)
            .truncate(mode == CREATE || opts.trunc)
            .create_new(opts.excl);
    }
    if let Some(bits) = opts.mode {
        open.mode(bits);
    }
    open.custom_flags(nix::fcntl::OFlag::O_NOCTTY.bits());

    let file = open.open(path).map_err(|e| OpenError::from_io(format!("{name}: open"), e))?;
    tracing::debug!(%name, direction = %req.direction, "file opened");

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
    if opts.unlink_close {
        stream = stream.with_unlink_on_close(path);
    }
    Ok(stream)
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_socket())
}
