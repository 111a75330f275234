//! Typed per-address options.
//!
//! Options are validated once at parse time; drivers and the opener read the
//! typed fields and ignore the ones that do not concern them.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::endpoint::{CHILD_GRACE, ClosePolicy, LineTerm, ShutdownAction};
use crate::error::ParseError;

/// One `name[=value]` item as written in the chain text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AddressOption {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl AddressOption {
    pub fn parse(item: &str) -> Self {
        match item.split_once('=') {
            Some((name, value)) => Self {
                name: name.trim().to_string(),
                value: Some(value.to_string()),
            },
            None => Self {
                name: item.trim().to_string(),
                value: None,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressOptions {
    // retry
    pub retry: Option<u32>,
    pub forever: bool,
    pub interval: Option<Duration>,

    // engine behavior
    pub ignore_eof: bool,
    pub escape: Option<u8>,
    pub line_term: LineTerm,
    pub read_bytes: Option<usize>,

    // cleanup
    pub unlink_close: bool,
    pub lock: Option<PathBuf>,
    /// Overrides the write-half shutdown action of the driver.
    pub shut: Option<ShutdownAction>,
    /// Overrides the close policy of the driver.
    pub close: Option<ClosePolicy>,

    // file open flags
    pub append: bool,
    pub trunc: bool,
    pub creat: bool,
    pub excl: bool,
    pub mode: Option<u32>,

    // terminal
    pub raw: bool,

    // child processes
    pub pipes: bool,
    pub pty: bool,
    pub stderr: bool,
}

impl AddressOptions {
    pub fn from_list(list: &[AddressOption]) -> Result<Self, ParseError> {
        let mut opts = AddressOptions::default();
        for opt in list {
            opts.apply(opt)?;
        }
        Ok(opts)
    }

    fn apply(&mut self, opt: &AddressOption) -> Result<(), ParseError> {
        let name = opt.name.to_ascii_lowercase();
        let value = opt.value.as_deref();
        match name.as_str() {
            "retry" => self.retry = Some(parse_num(&name, value)?),
            "forever" => self.forever = parse_flag(&name, value)?,
            "interval" | "intervall" => self.interval = Some(parse_secs(&name, value)?),
            "ignoreeof" | "ignore-eof" => self.ignore_eof = parse_flag(&name, value)?,
            "escape" => self.escape = Some(parse_byte(&name, value)?),
            "cr" => self.line_term = LineTerm::Cr,
            "crnl" => self.line_term = LineTerm::CrNl,
            "readbytes" | "rb" => self.read_bytes = Some(parse_num(&name, value)?),
            "unlink-close" => self.unlink_close = parse_flag(&name, value)?,
            "lock" => self.lock = Some(PathBuf::from(required(&name, value)?)),
            "shut-none" | "shut-close" | "shut-down" | "shut-null" | "shut-sighup" | "shut-sigterm"
            | "shut-sigkill" => {
                if parse_flag(&name, value)? {
                    self.shut = Some(shut_action(&name));
                }
            }
            "close" | "end-close" => {
                let raw = required(&name, value)?;
                self.close = Some(close_policy(raw).ok_or_else(|| invalid(&name, raw))?);
            }
            "append" => self.append = parse_flag(&name, value)?,
            "trunc" => self.trunc = parse_flag(&name, value)?,
            "creat" | "create" => self.creat = parse_flag(&name, value)?,
            "excl" => self.excl = parse_flag(&name, value)?,
            "mode" | "perm" => {
                let raw = required(&name, value)?;
                let mode = u32::from_str_radix(raw.trim_start_matches("0o"), 8)
                    .map_err(|_| invalid(&name, raw))?;
                self.mode = Some(mode);
            }
            "raw" => self.raw = parse_flag(&name, value)?,
            "pipes" => self.pipes = parse_flag(&name, value)?,
            "pty" => self.pty = parse_flag(&name, value)?,
            "stderr" => self.stderr = parse_flag(&name, value)?,
            _ => return Err(ParseError::UnknownOption(opt.name.clone())),
        }
        Ok(())
    }
}

fn shut_action(name: &str) -> ShutdownAction {
    let signal = |signal| ShutdownAction::Signal { signal, grace: None };
    match name {
        "shut-close" => ShutdownAction::Close,
        "shut-down" => ShutdownAction::Down,
        "shut-null" => ShutdownAction::NullPacket,
        "shut-sighup" => signal(Signal::SIGHUP),
        "shut-sigterm" => signal(Signal::SIGTERM),
        "shut-sigkill" => signal(Signal::SIGKILL),
        _ => ShutdownAction::None,
    }
}

fn close_policy(value: &str) -> Option<ClosePolicy> {
    Some(match value.to_ascii_lowercase().as_str() {
        "none" => ClosePolicy::None,
        "close" => ClosePolicy::Close,
        "sigterm" => ClosePolicy::Signal(Signal::SIGTERM),
        "sigkill" => ClosePolicy::Signal(Signal::SIGKILL),
        "close-sigterm" => ClosePolicy::CloseThenSignal(Signal::SIGTERM),
        "close-sigkill" => ClosePolicy::CloseThenSignal(Signal::SIGKILL),
        "sleep-sigterm" => ClosePolicy::SleepThenSignal(Signal::SIGTERM, CHILD_GRACE),
        _ => return None,
    })
}

fn invalid(name: &str, value: &str) -> ParseError {
    ParseError::InvalidOptionValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn required<'v>(name: &str, value: Option<&'v str>) -> Result<&'v str, ParseError> {
    value.ok_or_else(|| ParseError::MissingOptionValue(name.to_string()))
}

fn parse_flag(name: &str, value: Option<&str>) -> Result<bool, ParseError> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None | Some("1") | Some("yes") | Some("true") => Ok(true),
        Some("0") | Some("no") | Some("false") => Ok(false),
        Some(other) => Err(invalid(name, other)),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<T, ParseError> {
    let raw = required(name, value)?;
    raw.trim().parse().map_err(|_| invalid(name, raw))
}

fn parse_secs(name: &str, value: Option<&str>) -> Result<Duration, ParseError> {
    let raw = required(name, value)?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| invalid(name, raw))
}

/// Accepts `0x1d`, a decimal byte value, or a single character.
fn parse_byte(name: &str, value: Option<&str>) -> Result<u8, ParseError> {
    let raw = required(name, value)?;
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|_| invalid(name, raw));
    }
    if let Ok(n) = raw.parse::<u8>() {
        return Ok(n);
    }
    match raw.as_bytes() {
        [b] => Ok(*b),
        _ => Err(invalid(name, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(items: &[&str]) -> Result<AddressOptions, ParseError> {
        let list: Vec<_> = items.iter().map(|s| AddressOption::parse(s)).collect();
        AddressOptions::from_list(&list)
    }

    #[test]
    fn retry_options() {
        let o = opts(&["retry=3", "interval=0.25"]).unwrap();
        assert_eq!(o.retry, Some(3));
        assert_eq!(o.interval, Some(Duration::from_millis(250)));
        assert!(!o.forever);
        assert_eq!(opts(&[]).unwrap().retry, None);
    }

    #[test]
    fn escape_forms() {
        assert_eq!(opts(&["escape=0x1d"]).unwrap().escape, Some(0x1d));
        assert_eq!(opts(&["escape=3"]).unwrap().escape, Some(3));
        assert_eq!(opts(&["escape=q"]).unwrap().escape, Some(b'q'));
        assert!(opts(&["escape=qq"]).is_err());
    }

    #[test]
    fn flags_accept_explicit_values() {
        assert!(opts(&["ignoreeof"]).unwrap().ignore_eof);
        assert!(!opts(&["ignoreeof=0"]).unwrap().ignore_eof);
        assert!(opts(&["ignoreeof=maybe"]).is_err());
    }

    #[test]
    fn line_terms() {
        assert_eq!(opts(&["crnl"]).unwrap().line_term, LineTerm::CrNl);
        assert_eq!(opts(&["cr"]).unwrap().line_term, LineTerm::Cr);
    }

    #[test]
    fn teardown_overrides() {
        let o = opts(&["shut-sigterm", "close=sleep-sigterm"]).unwrap();
        assert_eq!(
            o.shut,
            Some(ShutdownAction::Signal {
                signal: Signal::SIGTERM,
                grace: None
            })
        );
        assert_eq!(o.close, Some(ClosePolicy::SleepThenSignal(Signal::SIGTERM, CHILD_GRACE)));
        assert_eq!(opts(&["shut-null"]).unwrap().shut, Some(ShutdownAction::NullPacket));
        assert_eq!(opts(&["shut-down=0"]).unwrap().shut, None);
        assert_eq!(opts(&["close=sigkill"]).unwrap().close, Some(ClosePolicy::Signal(Signal::SIGKILL)));
        assert!(matches!(
            opts(&["close=later"]),
            Err(ParseError::InvalidOptionValue { .. })
        ));
    }

    #[test]
    fn mode_is_octal() {
        assert_eq!(opts(&["mode=644"]).unwrap().mode, Some(0o644));
    }

    #[test]
    fn unknown_option_rejected() {
        assert_eq!(
            opts(&["bogus=1"]),
            Err(ParseError::UnknownOption("bogus".into()))
        );
        assert_eq!(
            opts(&["lock"]),
            Err(ParseError::MissingOptionValue("lock".into()))
        );
    }
}
