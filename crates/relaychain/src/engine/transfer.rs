//! Moving one block from a source endpoint to a destination endpoint.

use std::io;

use crate::endpoint::{EOF_ENDED, Endpoint, LineTerm};

use super::trace::TraceSink;

/// Result of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Moved {
    /// The source read returned zero bytes.
    Eof,
    /// Data was read but nothing was left to write after escape handling
    /// or line-end conversion.
    Nothing,
    Bytes(usize),
}

/// Read one chunk from `src` and write it to `dst`.
///
/// Read and write failures other than `WouldBlock` end the source
/// direction. A zero-length read ends it unless the source ignores eof and
/// is not yet closing.
pub(crate) fn transfer(
    src: &mut Endpoint,
    dst: &mut Endpoint,
    buf: &mut Vec<u8>,
    chunk: usize,
    trace: Option<&mut TraceSink>,
    right_to_left: bool,
) -> io::Result<Moved> {
    buf.clear();
    buf.resize(chunk, 0);

    let rs = src.read_stream_mut();
    let n = match rs.read_block(buf) {
        Ok(n) => n,
        Err(e) => {
            if e.kind() != io::ErrorKind::WouldBlock {
                rs.state.raise_eof(EOF_ENDED);
            }
            return Err(e);
        }
    };

    if n == 0 {
        if !(rs.ignore_eof && rs.state.closing() == 0) {
            rs.state.raise_eof(EOF_ENDED);
        }
        return Ok(Moved::Eof);
    }
    buf.truncate(n);

    if let Some(escape) = rs.escape
        && let Some(at) = buf.iter().position(|&b| b == escape)
    {
        tracing::info!(stream = %rs.name, "escape character found in input");
        rs.escape_seen = true;
        rs.state.raise_eof(EOF_ENDED);
        buf.truncate(at);
    }

    let from = rs.line_term;
    let rfd = rs.fds.raw_read();
    let to = dst.write_stream().line_term;
    if from != to {
        convert_line_terms(buf, from, to);
    }
    if buf.is_empty() {
        return Ok(Moved::Nothing);
    }

    if let Some(trace) = trace {
        trace.record(right_to_left, buf);
    }

    let ws = dst.write_stream_mut();
    let wfd = ws.fds.raw_write();
    match ws.write_block(buf) {
        Ok(written) => {
            if written < buf.len() {
                tracing::warn!(written, len = buf.len(), fd = wfd, "short write");
            }
            tracing::debug!(bytes = written, from = rfd, to = wfd, "transferred");
            Ok(Moved::Bytes(written))
        }
        Err(e) => {
            if e.kind() != io::ErrorKind::WouldBlock {
                src.read_stream().state.raise_eof(EOF_ENDED);
            }
            Err(e)
        }
    }
}

/// Rewrite line terminators of `buf` from one convention to another.
///
/// CR-NL sources drop every CR; the others map their terminator byte.
pub fn convert_line_terms(buf: &mut Vec<u8>, from: LineTerm, to: LineTerm) {
    match (from, to) {
        (a, b) if a == b => {}
        (LineTerm::Raw, LineTerm::Cr) => replace_byte(buf, b'\n', b'\r'),
        (LineTerm::Cr, LineTerm::Raw) => replace_byte(buf, b'\r', b'\n'),
        (LineTerm::CrNl, to) => {
            let term = if to == LineTerm::Raw { b'\n' } else { b'\r' };
            buf.retain(|&b| b != b'\r');
            replace_byte(buf, b'\n', term);
        }
        (from, _) => {
            let term = if from == LineTerm::Raw { b'\n' } else { b'\r' };
            let mut out = Vec::with_capacity(buf.len() * 2);
            for &b in buf.iter() {
                if b == term {
                    out.extend_from_slice(b"\r\n");
                } else {
                    out.push(b);
                }
            }
            *buf = out;
        }
    }
}

fn replace_byte(buf: &mut [u8], from: u8, to: u8) {
    for b in buf.iter_mut().filter(|b| **b == from) {
        *b = to;
    }
}
