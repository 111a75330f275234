//! Teardown policies every driver sets on the streams it produces.

use std::time::Duration;

use nix::sys::signal::Signal;

/// Pause before signalling a child that may still be flushing.
pub const CHILD_GRACE: Duration = Duration::from_secs(1);

/// Action taken when one half of a stream is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    None,
    /// Close the descriptor carrying this half.
    Close,
    /// `shutdown(2)` on the socket.
    Down,
    /// Signal the linked child, optionally after a grace sleep.
    Signal {
        signal: Signal,
        grace: Option<Duration>,
    },
    /// Switch the pty to canonical mode and write its EOF character.
    PtyEof,
    /// Hand the half-close to the record layer.
    Protocol,
    /// Send an empty datagram to mark end of stream.
    NullPacket,
}

/// Shutdown actions for the read and write halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub read: ShutdownAction,
    pub write: ShutdownAction,
}

impl ShutdownPolicy {
    pub const fn new(read: ShutdownAction, write: ShutdownAction) -> Self {
        Self { read, write }
    }

    pub const fn both(action: ShutdownAction) -> Self {
        Self::new(action, action)
    }

    /// Sockets: half-close the write side, leave reading to close time.
    pub const fn socket() -> Self {
        Self::new(ShutdownAction::None, ShutdownAction::Down)
    }
}

/// Action taken when the stream is closed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Leave descriptors open.
    None,
    Close,
    Signal(Signal),
    CloseThenSignal(Signal),
    SleepThenSignal(Signal, Duration),
    /// Let the record layer finish its session, then close.
    Protocol,
}
