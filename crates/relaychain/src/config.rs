//! Relay-wide settings.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_CLOSE_WAIT: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which directions the top-level relay carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionMode {
    #[default]
    Bidirectional,
    /// Data only flows from the first address to the second.
    LeftToRight,
    /// Data only flows from the second address to the first.
    RightToLeft,
}

/// Pairing primitive used to wire an intermediate hop to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommKind {
    /// Two socketpairs, each half-closed so it carries one direction.
    #[default]
    SocketPairs,
    /// Two anonymous pipes.
    Pipes,
    /// One socketpair used in both directions.
    SocketPair,
    /// Two pseudo-terminals in raw mode.
    Ptys,
    /// One pseudo-terminal in raw mode.
    Pty,
    /// A connected loopback TCP pair.
    Tcp,
}

impl FromStr for CommKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S" | "socketpairs" => Ok(CommKind::SocketPairs),
            "P" | "pipes" => Ok(CommKind::Pipes),
            "s" | "socketpair" => Ok(CommKind::SocketPair),
            "Y" | "ptys" => Ok(CommKind::Ptys),
            "y" | "pty" => Ok(CommKind::Pty),
            "t" | "tcp" => Ok(CommKind::Tcp),
            other => Err(format!("unknown comm type \"{other}\"")),
        }
    }
}

/// How transferred blocks are mirrored to the trace sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Text,
    Hex,
    Both,
}

impl TraceMode {
    /// Combine the `-v` and `-x` switches.
    pub fn from_flags(text: bool, hex: bool) -> Option<Self> {
        match (text, hex) {
            (false, false) => None,
            (true, false) => Some(TraceMode::Text),
            (false, true) => Some(TraceMode::Hex),
            (true, true) => Some(TraceMode::Both),
        }
    }
}

/// Settings consulted by the opener and every engine instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_size: usize,
    /// Grace period once one side has finished, before the relay is torn down.
    pub close_wait: Duration,
    /// Re-poll cadence for sources in ignore-eof mode.
    pub poll_interval: Duration,
    /// Tear the relay down after this much inactivity.
    pub total_timeout: Option<Duration>,
    pub direction: DirectionMode,
    pub comm_kind: CommKind,
    pub trace: Option<TraceMode>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            close_wait: DEFAULT_CLOSE_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            total_timeout: None,
            direction: DirectionMode::default(),
            comm_kind: CommKind::default(),
            trace: None,
        }
    }
}

impl RelayConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_close_wait(mut self, wait: Duration) -> Self {
        self.close_wait = wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn with_direction(mut self, direction: DirectionMode) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_comm_kind(mut self, kind: CommKind) -> Self {
        self.comm_kind = kind;
        self
    }

    pub fn with_trace(mut self, trace: Option<TraceMode>) -> Self {
        self.trace = trace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_kind_accepts_letters_and_names() {
        assert_eq!("S".parse::<CommKind>().unwrap(), CommKind::SocketPairs);
        assert_eq!("y".parse::<CommKind>().unwrap(), CommKind::Pty);
        assert_eq!("tcp".parse::<CommKind>().unwrap(), CommKind::Tcp);
        assert!("x".parse::<CommKind>().is_err());
    }

    #[test]
    fn builder_clamps_buffer_size() {
        let config = RelayConfig::default().with_buffer_size(0);
        assert_eq!(config.buffer_size, 1);
        assert_eq!(config.close_wait, DEFAULT_CLOSE_WAIT);
    }

    #[test]
    fn trace_mode_from_flags() {
        assert_eq!(TraceMode::from_flags(false, false), None);
        assert_eq!(TraceMode::from_flags(true, true), Some(TraceMode::Both));
    }
}
