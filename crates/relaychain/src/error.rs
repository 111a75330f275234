//! Error types shared by the parser, the opener and the engine.

use std::fmt;
use std::io;

/// Outcome of a driver open or an option application.
///
/// Mirrors the status vocabulary every driver reports back to the opener.
/// Only the three retry classes ever travel inside an [`OpenError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenStatus {
    Ok,
    Warning,
    /// The driver asks the program to terminate without relaying.
    Exit,
    /// The request did not apply to this driver.
    NoAction,
    RetryNow,
    RetryLater,
    NoRetry,
}

impl OpenStatus {
    pub fn is_retryable(self) -> bool {
        matches!(self, OpenStatus::RetryNow | OpenStatus::RetryLater)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpenStatus::Ok => "OK",
            OpenStatus::Warning => "WARNING",
            OpenStatus::Exit => "EXIT",
            OpenStatus::NoAction => "NO-ACTION",
            OpenStatus::RetryNow => "RETRY-NOW",
            OpenStatus::RetryLater => "RETRY-LATER",
            OpenStatus::NoRetry => "NO-RETRY",
        }
    }
}

impl fmt::Display for OpenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed chain text. Always permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty address")]
    Empty,

    #[error("unknown address keyword \"{0}\"")]
    UnknownKeyword(String),

    #[error("{keyword}: wrong number of parameters ({given} given, expected {expected})")]
    ParamCount {
        keyword: String,
        given: usize,
        expected: String,
    },

    #[error("unterminated {0} in \"{1}\"")]
    Unterminated(&'static str, String),

    #[error("unbalanced '{close}' in \"{text}\"")]
    Unbalanced { close: char, text: String },

    #[error("unexpected text \"{0}\" after address")]
    TrailingGarbage(String),

    #[error("unknown option \"{0}\"")]
    UnknownOption(String),

    #[error("option {name}: invalid value \"{value}\"")]
    InvalidOptionValue { name: String, value: String },

    #[error("option {0} requires a value")]
    MissingOptionValue(String),
}

/// A driver or chain-assembly failure, classified for the retry logic.
#[derive(Debug, thiserror::Error)]
#[error("{message} [{status}]")]
pub struct OpenError {
    pub status: OpenStatus,
    pub message: String,
    #[source]
    pub source: Option<io::Error>,
}

impl OpenError {
    pub fn new(status: OpenStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        Self::new(OpenStatus::NoRetry, message)
    }

    /// Classify an OS error: refusals and lock contention are transient,
    /// everything else is configuration.
    pub fn from_io(context: impl Into<String>, err: io::Error) -> Self {
        let status = match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::WouldBlock => OpenStatus::RetryLater,
            io::ErrorKind::Interrupted => OpenStatus::RetryNow,
            _ => OpenStatus::NoRetry,
        };
        Self {
            status,
            message: format!("{}: {}", context.into(), err),
            source: Some(err),
        }
    }
}

/// Everything that can stop a chain from opening.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("{keyword}: no variant supports {wanted}")]
    NoMatchingVariant { keyword: String, wanted: String },

    #[error("hop task failed to start: {0}")]
    Spawn(#[source] io::Error),
}

impl ChainError {
    pub fn status(&self) -> OpenStatus {
        match self {
            ChainError::Parse(_) => OpenStatus::NoRetry,
            ChainError::Open(e) => e.status,
            ChainError::NoMatchingVariant { .. } => OpenStatus::NoRetry,
            ChainError::Spawn(_) => OpenStatus::RetryLater,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}

/// Fatal error inside the transfer loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("invalid descriptor {fd} in readiness set")]
    InvalidDescriptor { fd: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReaperError {
    #[error("child table full ({0} entries)")]
    TableFull(usize),

    #[error("reaper is not running")]
    Stopped,
}

/// Top-level relay failure.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("address {index}: {source}")]
    Open {
        index: usize,
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = ChainError> = std::result::Result<T, E>;
