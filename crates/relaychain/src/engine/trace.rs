//! Mirroring transferred blocks for `-v` / `-x`.

use std::fmt::Write as _;
use std::io::{self, Write};

use crate::config::TraceMode;

/// Writes a header and a rendering of every transferred block.
pub struct TraceSink {
    mode: TraceMode,
    out: Box<dyn Write + Send>,
    left_to_right: u64,
    right_to_left: u64,
}

impl TraceSink {
    pub fn new(mode: TraceMode, out: Box<dyn Write + Send>) -> Self {
        Self {
            mode,
            out,
            left_to_right: 0,
            right_to_left: 0,
        }
    }

    pub fn stderr(mode: TraceMode) -> Self {
        Self::new(mode, Box::new(io::stderr()))
    }

    pub fn record(&mut self, right_to_left: bool, data: &[u8]) {
        let (prefix, counter) = if right_to_left {
            ('<', &mut self.right_to_left)
        } else {
            ('>', &mut self.left_to_right)
        };
        let from = *counter;
        *counter += data.len() as u64;

        let timestamp = chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f");
        let mut text = format!(
            "{prefix} {timestamp} length={} from={from} to={}\n",
            data.len(),
            (from + data.len() as u64).saturating_sub(1)
        );
        text.push_str(&render(self.mode, data));

        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            tracing::debug!(error = %e, "trace sink write failed");
        }
    }
}

pub fn render(mode: TraceMode, data: &[u8]) -> String {
    match mode {
        TraceMode::Text => render_text(data),
        TraceMode::Hex => render_hex_line(data),
        TraceMode::Both => render_hex_dump(data),
    }
}

/// Printable text with control characters spelled out.
pub fn render_text(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            0x07 => out.push_str("\\a"),
            0x08 => out.push_str("\\b"),
            b'\t' => out.push('\t'),
            b'\n' => out.push('\n'),
            0x0b => out.push_str("\\v"),
            0x0c => out.push_str("\\f"),
            b'\r' => out.push_str("\\r"),
            b'\\' => out.push_str("\\\\"),
            c if c.is_ascii_graphic() || c == b' ' => out.push(c as char),
            _ => out.push('.'),
        }
    }
    out
}

pub fn render_hex_line(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3 + 1);
    for b in data {
        let _ = write!(out, " {b:02x}");
    }
    out.push('\n');
    out
}

/// Rows of up to 16 bytes with an ASCII column. A newline ends its row.
pub fn render_hex_dump(data: &[u8]) -> String {
    const WIDTH: usize = 16;
    let mut out = String::new();
    let mut rest = data;
    while !rest.is_empty() {
        let mut len = rest.len().min(WIDTH);
        if let Some(nl) = rest[..len].iter().position(|&b| b == b'\n') {
            len = nl + 1;
        }
        let (row, tail) = rest.split_at(len);
        for b in row {
            let _ = write!(out, " {b:02x}");
        }
        out.push_str(&"   ".repeat(WIDTH - row.len()));
        out.push_str("  ");
        out.extend(row.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
        rest = tail;
    }
    out.push_str("--\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn text_escapes_control_chars() {
        assert_eq!(render_text(b"a\r\nb\\\x01"), "a\\r\nb\\\\.");
    }

    #[test]
    fn hex_line() {
        assert_eq!(render_hex_line(b"AB\n"), " 41 42 0a\n");
    }

    #[test]
    fn hex_dump_breaks_rows_at_newline() {
        let dump = render_hex_dump(b"hi\nthere");
        let rows: Vec<_> = dump.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with(" 68 69 0a "));
        assert!(rows[0].ends_with("  hi."));
        assert!(rows[1].ends_with("  there"));
        assert_eq!(rows[2], "--");
    }

    #[test]
    fn headers_count_bytes_per_direction() {
        let out = Shared::default();
        let mut sink = TraceSink::new(TraceMode::Text, Box::new(out.clone()));
        sink.record(false, b"abc");
        sink.record(false, b"de");
        sink.record(true, b"x");

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let headers: Vec<_> = text.lines().filter(|l| l.contains("length=")).collect();
        assert!(headers[0].starts_with("> ") && headers[0].ends_with("length=3 from=0 to=2"));
        assert!(headers[1].ends_with("length=2 from=3 to=4"));
        // text mode adds no newline after a block
        assert!(headers[2].contains("< ") && headers[2].ends_with("length=1 from=0 to=0"));
    }
}
