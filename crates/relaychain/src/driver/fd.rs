//! Already open descriptors, named by number.

use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use crate::direction::{DirMask, Direction};
use crate::endpoint::{ClosePolicy, Stream, StreamFds};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest, plain_shutdown};

pub(super) static DESCS: &[AddressDesc] = &[AddressDesc {
    keyword: "FD",
    kind: DescKind::Endpoint,
    min_params: 1,
    max_params: 2,
    local_dirs: DirMask::ALL,
    net_dirs: DirMask::empty(),
    open: open_fd,
    args: [0; 3],
}];

/// `FD:n` uses one descriptor both ways; `FD:r:w` reads `r` and writes `w`.
fn open_fd(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let first = parse_fd(req.param(0)?)?;
    let second = match req.params.get(1) {
        Some(p) => Some(parse_fd(p)?),
        None => None,
    };

    let name = format!("FD:{}", req.params.join(":"));
    let dup = |fd: RawFd| duplicate(fd).map_err(|e| OpenError::from_io(format!("{name}: descriptor {fd}"), e));

    let fds = match (second, req.direction) {
        (None, Direction::ReadWrite) => StreamFds::Single(dup(first)?),
        (None, Direction::Read) => StreamFds::split(Some(dup(first)?), None),
        (None, Direction::Write) => StreamFds::split(None, Some(dup(first)?)),
        (Some(w), dir) => StreamFds::split(
            dir.can_read().then(|| dup(first)).transpose()?,
            dir.can_write().then(|| dup(w)).transpose()?,
        ),
    };
    let shutdown = plain_shutdown(&fds);
    tracing::debug!(%name, direction = %req.direction, "using inherited descriptors");
    // the numbered descriptors themselves stay open, only our copies close
    Ok(Stream::new(name, fds, req.direction, shutdown, ClosePolicy::Close))
}

fn parse_fd(text: &str) -> Result<RawFd, OpenError> {
    text.parse::<RawFd>()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| OpenError::no_retry(format!("FD: invalid descriptor number \"{text}\"")))
}

fn duplicate(fd: RawFd) -> io::Result<File> {
    // Safety: the borrow lives only for the duplication below, which fails
    // with EBADF if the descriptor is not open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(File::from(borrowed.try_clone_to_owned()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressOptions;
    use crate::driver::{Caps, DriverEnv};
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    fn open(params: &[String], direction: Direction) -> Result<Stream, OpenError> {
        let env = DriverEnv::default();
        let options = AddressOptions::default();
        open_fd(OpenRequest {
            keyword: "FD",
            params,
            options: &options,
            direction,
            caps: Caps::empty(),
            args: [0; 3],
            carrier: None,
            env: &env,
        })
    }

    #[test]
    fn reads_from_numbered_descriptor() {
        let (r, mut w) = std::io::pipe().unwrap();
        let mut stream = open(&[r.as_raw_fd().to_string()], Direction::Read).unwrap();
        w.write_all(b"fd").unwrap();
        let mut buf = [0u8; 2];
        stream.read_block(&mut buf).unwrap();
        assert_eq!(&buf, b"fd");

        // the original stays usable after our copy is gone
        drop(stream);
        w.write_all(b"!").unwrap();
        let mut one = [0u8; 1];
        (&r).read_exact(&mut one).unwrap();
        assert_eq!(&one, b"!");
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = open(&["x".to_string()], Direction::Read).unwrap_err();
        assert_eq!(err.status, crate::error::OpenStatus::NoRetry);
    }
}
