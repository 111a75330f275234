//! Length-prefixed record framing as an intermediate hop.
//!
//! Each written block travels as one frame with a 4-byte big-endian length.
//! A zero-length frame marks the end of the stream.

use std::fs::File;
use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::direction::DirMask;
use crate::endpoint::{ClosePolicy, DataMethod, RecordLayer, ShutdownAction, ShutdownPolicy, Stream, read_file};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest};

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 8192;

pub(super) static DESCS: &[AddressDesc] = &[AddressDesc {
    keyword: "FRAME",
    kind: DescKind::Inter,
    min_params: 0,
    max_params: 0,
    local_dirs: DirMask::ALL,
    net_dirs: DirMask::ALL,
    open: open_frame,
    args: [0; 3],
}];

fn open_frame(mut req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let mut stream = req
        .take_carrier()?
        .renamed(req.keyword)
        .with_method(DataMethod::Record(Box::new(FrameLayer::new())));
    let read = stream.shutdown_policy().read;
    stream.set_policies(ShutdownPolicy::new(read, ShutdownAction::Protocol), ClosePolicy::Protocol);
    Ok(stream)
}

#[derive(Debug)]
pub struct FrameLayer {
    codec: LengthDelimitedCodec,
    inbound: BytesMut,
    /// Remainder of the frame currently being handed out.
    current: Bytes,
    ended: bool,
    shut: bool,
}

impl Default for FrameLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLayer {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .big_endian()
                .new_codec(),
            inbound: BytesMut::new(),
            current: Bytes::new(),
            ended: false,
            shut: false,
        }
    }

    fn take_current(&mut self, buf: &mut [u8]) -> usize {
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        n
    }

    /// Move the next complete frame into `current`. Returns false if none
    /// is buffered yet.
    fn next_frame(&mut self) -> io::Result<bool> {
        match self.codec.decode(&mut self.inbound)? {
            Some(frame) if frame.is_empty() => {
                tracing::debug!("end-of-stream frame received");
                self.ended = true;
                Ok(true)
            }
            Some(frame) => {
                self.current = frame.freeze();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `inbound` already holds a complete frame.
    fn frame_buffered(&self) -> bool {
        if self.inbound.len() < HEADER_LEN {
            return false;
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.inbound[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        self.inbound.len() >= HEADER_LEN + len
    }

    fn send(&mut self, file: &File, data: Bytes) -> io::Result<()> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + data.len());
        self.codec.encode(data, &mut out)?;
        (&mut &*file).write_all(&out)
    }
}

impl RecordLayer for FrameLayer {
    fn read(&mut self, file: &File, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                return Ok(self.take_current(buf));
            }
            if self.ended {
                return Ok(0);
            }
            if self.next_frame()? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = read_file(file, &mut chunk)?;
            if n == 0 {
                if !self.inbound.is_empty() {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame"));
                }
                self.ended = true;
                return Ok(0);
            }
            self.inbound.extend_from_slice(&chunk[..n]);
            if !self.next_frame()? {
                // partial frame; wait for the rest
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }
    }

    fn write(&mut self, file: &File, data: &[u8]) -> io::Result<usize> {
        self.send(file, Bytes::copy_from_slice(data))?;
        Ok(data.len())
    }

    fn pending(&self) -> usize {
        self.current.len() + usize::from(self.frame_buffered())
    }

    fn shutdown(&mut self, file: &File) -> io::Result<()> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        tracing::debug!("sending end-of-stream frame");
        self.send(file, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn pipe() -> (File, File) {
        let (r, w) = std::io::pipe().unwrap();
        (File::from(OwnedFd::from(r)), File::from(OwnedFd::from(w)))
    }

    #[test]
    fn frames_survive_small_reads() {
        let (r, w) = pipe();
        let mut writer = FrameLayer::new();
        writer.write(&w, b"hello").unwrap();
        writer.write(&w, b"world").unwrap();

        let mut reader = FrameLayer::new();
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        // the rest of the first frame and all of the second are buffered
        assert!(reader.pending() > 0);
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        let mut big = [0u8; 16];
        assert_eq!(reader.read(&r, &mut big).unwrap(), 5);
        assert_eq!(&big[..5], b"world");
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn empty_frame_ends_stream_once() {
        let (r, w) = pipe();
        let mut writer = FrameLayer::new();
        writer.write(&w, b"x").unwrap();
        writer.shutdown(&w).unwrap();
        writer.close(&w).unwrap();
        drop(w);

        let mut reader = FrameLayer::new();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 1);
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 0);
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn partial_frame_would_block() {
        let (r, w) = pipe();
        (&w).write_all(&[0, 0, 0, 4, b'a']).unwrap();
        let mut reader = FrameLayer::new();
        let mut buf = [0u8; 8];
        let err = reader.read(&r, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        (&w).write_all(b"bcd").unwrap();
        assert_eq!(reader.read(&r, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }
}
