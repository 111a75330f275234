//! TCP, UDP and UNIX domain sockets.

use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::direction::{DirMask, Direction};
use crate::endpoint::{ClosePolicy, ShutdownAction, ShutdownPolicy, Stream, StreamFds};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest};

const LISTEN_BACKLOG: i32 = 5;

pub(super) static DESCS: &[AddressDesc] = &[
    AddressDesc {
        keyword: "TCP",
        kind: DescKind::Endpoint,
        min_params: 2,
        max_params: 2,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_tcp_connect,
        args: [0; 3],
    },
    AddressDesc {
        keyword: "TCP-LISTEN",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_tcp_listen,
        args: [0; 3],
    },
    AddressDesc {
        keyword: "UNIX-CONNECT",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_unix_connect,
        args: [0; 3],
    },
    AddressDesc {
        keyword: "UNIX-LISTEN",
        kind: DescKind::Endpoint,
        min_params: 1,
        max_params: 1,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_unix_listen,
        args: [0; 3],
    },
    AddressDesc {
        keyword: "UDP",
        kind: DescKind::Endpoint,
        min_params: 2,
        max_params: 2,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::empty(),
        open: open_udp,
        args: [0; 3],
    },
];

fn socket_stream(name: String, fd: OwnedFd, direction: Direction, shutdown: ShutdownPolicy) -> Stream {
    let file = File::from(fd);
    let fds = match direction {
        Direction::ReadWrite => StreamFds::Single(file),
        Direction::Read => StreamFds::split(Some(file), None),
        Direction::Write => StreamFds::split(None, Some(file)),
    };
    Stream::new(name, fds, direction, shutdown, ClosePolicy::Close)
}

fn resolve(host: &str, port: &str) -> Result<Vec<SocketAddr>, OpenError> {
    let port: u16 = port
        .parse()
        .map_err(|_| OpenError::no_retry(format!("invalid port \"{port}\"")))?;
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| OpenError::from_io(format!("resolving {host}"), e))?
        .collect();
    if addrs.is_empty() {
        return Err(OpenError::no_retry(format!("{host}: no addresses")));
    }
    Ok(addrs)
}

fn open_tcp_connect(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let (host, port) = (req.param(0)?, req.param(1)?);
    let name = format!("TCP:{host}:{port}");
    let mut last = None;
    for addr in resolve(host, port)? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                tracing::info!(%name, peer = %addr, "connected");
                return Ok(socket_stream(name, stream.into(), req.direction, ShutdownPolicy::socket()));
            }
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "connect failed");
                last = Some(e);
            }
        }
    }
    let err = last.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
    Err(OpenError::from_io(format!("{name}: connect"), err))
}

fn open_tcp_listen(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let port = req.param(0)?;
    let name = format!("TCP-LISTEN:{port}");
    let addr = resolve("0.0.0.0", port)?[0];
    let io_err = |what: &str, e: io::Error| OpenError::from_io(format!("{name}: {what}"), e);

    let listener =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(|e| io_err("socket", e))?;
    listener.set_reuse_address(true).map_err(|e| io_err("reuseaddr", e))?;
    listener.bind(&SockAddr::from(addr)).map_err(|e| io_err("bind", e))?;
    listener.listen(LISTEN_BACKLOG).map_err(|e| io_err("listen", e))?;
    tracing::info!(%name, "listening");

    let (conn, peer) = listener.accept().map_err(|e| io_err("accept", e))?;
    tracing::info!(%name, peer = ?peer.as_socket(), "accepted connection");
    Ok(socket_stream(name, conn.into(), req.direction, ShutdownPolicy::socket()))
}

fn open_unix_connect(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let path = req.param(0)?;
    let name = format!("UNIX-CONNECT:{path}");
    let stream = UnixStream::connect(path).map_err(|e| OpenError::from_io(format!("{name}: connect"), e))?;
    tracing::info!(%name, "connected");
    Ok(socket_stream(name, stream.into(), req.direction, ShutdownPolicy::socket()))
}

fn open_unix_listen(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let path = Path::new(req.param(0)?);
    let name = format!("UNIX-LISTEN:{}", path.display());
    let listener = UnixListener::bind(path).map_err(|e| OpenError::from_io(format!("{name}: bind"), e))?;
    tracing::info!(%name, "listening");

    let accepted = listener.accept();
    drop(listener);
    let (conn, _) = match accepted {
        Ok(conn) => conn,
        Err(e) => {
            let _ = std::fs::remove_file(path);
            return Err(OpenError::from_io(format!("{name}: accept"), e));
        }
    };
    tracing::info!(%name, "accepted connection");
    Ok(socket_stream(name, conn.into(), req.direction, ShutdownPolicy::socket()).with_unlink_on_close(path))
}

fn open_udp(req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let (host, port) = (req.param(0)?, req.param(1)?);
    let name = format!("UDP:{host}:{port}");
    let peer = resolve(host, port)?[0];
    let local: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let io_err = |what: &str, e: io::Error| OpenError::from_io(format!("{name}: {what}"), e);
    let socket = UdpSocket::bind(local).map_err(|e| io_err("bind", e))?;
    socket.connect(peer).map_err(|e| io_err("connect", e))?;
    tracing::info!(%name, local = ?socket.local_addr().ok(), "datagram socket connected");
    // an empty datagram tells the peer this direction is done
    let shutdown = ShutdownPolicy::new(ShutdownAction::None, ShutdownAction::NullPacket);
    Ok(socket_stream(name, socket.into(), req.direction, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressOptions;
    use crate::driver::{Caps, DriverEnv};
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn open(open: crate::driver::OpenFn, params: &[String]) -> Result<Stream, OpenError> {
        let env = DriverEnv::default();
        let options = AddressOptions::default();
        open(OpenRequest {
            keyword: "TEST",
            params,
            options: &options,
            direction: Direction::ReadWrite,
            caps: Caps::empty(),
            args: [0; 3],
            carrier: None,
            env: &env,
        })
    }

    #[test]
    fn tcp_connect_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let mut stream = open(open_tcp_connect, &["127.0.0.1".into(), port]).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        stream.write_block(b"hi").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        peer.write_all(b"yo").unwrap();
        stream.read_block(&mut buf).unwrap();
        assert_eq!(&buf, b"yo");
    }

    #[test]
    fn refused_connect_is_retryable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = open(open_tcp_connect, &["127.0.0.1".into(), port.to_string()]).unwrap_err();
        assert!(err.status.is_retryable(), "{err}");
    }

    #[test]
    fn unix_listen_unlinks_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let connect_path = path.clone();
        let client = std::thread::spawn(move || {
            for _ in 0..100 {
                if let Ok(sock) = UnixStream::connect(&connect_path) {
                    return sock;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            panic!("listener never came up");
        });

        let stream = open(open_unix_listen, &[path.display().to_string()]).unwrap();
        let _client = client.join().unwrap();
        assert!(path.exists());

        let mut ep = crate::endpoint::Endpoint::Single(stream);
        crate::shutdown::close(&mut ep);
        assert!(!path.exists());
    }
}
