//! Child process tracking.
//!
//! A single actor task owns the child table. Each spawned child gets a
//! watcher task that waits for its exit and posts it to the actor, which
//! runs the registered callback and frees the slot. Deaths of children that
//! are not in the table are kept in a short history for diagnostics.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ReaperError;

/// Capacity of the child table.
pub const MAX_CHILDREN: usize = 16;
/// How many untracked deaths are remembered.
pub const UNTRACKED_HISTORY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: u32,
    pub status: ExitStatus,
}

impl ChildExit {
    pub fn new(pid: u32, status: ExitStatus) -> Self {
        Self { pid, status }
    }

    #[cfg(test)]
    pub(crate) fn for_test(pid: u32) -> Self {
        Self::new(pid, ExitStatus::from_raw(0))
    }
}

/// Owner of a child process, told when it starts and when it dies.
pub trait ChildObserver: Send + Sync {
    fn attached(&self, pid: u32);
    fn exited(&self, exit: &ChildExit);
}

pub type ExitCallback = Box<dyn FnOnce(&ChildExit) + Send>;

struct ChildRecord {
    pid: u32,
    callback: ExitCallback,
}

/// Fixed-capacity table of watched children.
pub struct ChildTable {
    slots: [Option<ChildRecord>; MAX_CHILDREN],
    untracked: [Option<u32>; UNTRACKED_HISTORY],
    untracked_next: usize,
}

impl Default for ChildTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            untracked: [None; UNTRACKED_HISTORY],
            untracked_next: 0,
        }
    }

    /// Insert or overwrite the entry for `pid`.
    pub fn register(&mut self, pid: u32, callback: ExitCallback) -> Result<(), ReaperError> {
        let existing = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.pid == pid));
        let index = existing
            .or_else(|| self.slots.iter().position(Option::is_none))
            .ok_or(ReaperError::TableFull(MAX_CHILDREN))?;
        self.slots[index] = Some(ChildRecord { pid, callback });
        Ok(())
    }

    /// Remove the entry for `pid` if there is one.
    pub fn unregister(&mut self, pid: u32) -> bool {
        self.take(pid).is_some()
    }

    pub fn take(&mut self, pid: u32) -> Option<ExitCallback> {
        self.slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|r| r.pid == pid))
            .and_then(Option::take)
            .map(|r| r.callback)
    }

    pub fn record_untracked(&mut self, pid: u32) {
        self.untracked[self.untracked_next] = Some(pid);
        self.untracked_next = (self.untracked_next + 1) % UNTRACKED_HISTORY;
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<u32> {
        self.slots.iter().flatten().map(|r| r.pid).collect()
    }

    /// Untracked deaths, most recent first.
    pub fn untracked(&self) -> Vec<u32> {
        (1..=UNTRACKED_HISTORY)
            .filter_map(|back| {
                self.untracked[(self.untracked_next + UNTRACKED_HISTORY - back) % UNTRACKED_HISTORY]
            })
            .collect()
    }
}

/// Point-in-time view of the reaper, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSnapshot {
    pub tracked: Vec<u32>,
    pub untracked: Vec<u32>,
    pub active: usize,
}

enum ReaperCommand {
    Register {
        pid: u32,
        callback: ExitCallback,
        reply: oneshot::Sender<Result<(), ReaperError>>,
    },
    Unregister {
        pid: u32,
    },
    Exited(ChildExit),
    Snapshot {
        reply: oneshot::Sender<ReaperSnapshot>,
    },
}

/// Cloneable access to the reaper actor. Usable from any thread.
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<ReaperCommand>,
    runtime: tokio::runtime::Handle,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ReaperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperHandle")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

/// Start the reaper on the current runtime.
///
/// The actor stops once every handle is dropped.
pub fn spawn() -> (ReaperHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicUsize::new(0));
    let runtime = tokio::runtime::Handle::current();
    let task = runtime.spawn(run(rx, active.clone()));
    (ReaperHandle { tx, runtime, active }, task)
}

async fn run(mut rx: mpsc::UnboundedReceiver<ReaperCommand>, active: Arc<AtomicUsize>) {
    let mut table = ChildTable::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            ReaperCommand::Register { pid, callback, reply } => {
                let result = table.register(pid, callback);
                if let Err(ref e) = result {
                    tracing::warn!(pid, error = %e, "cannot watch child");
                }
                let _ = reply.send(result);
            }
            ReaperCommand::Unregister { pid } => {
                if !table.unregister(pid) {
                    tracing::trace!(pid, "unregister: child not in table");
                }
            }
            ReaperCommand::Exited(exit) => {
                log_exit(&exit);
                let _ = active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
                match table.take(exit.pid) {
                    Some(callback) => callback(&exit),
                    None => {
                        tracing::debug!(pid = exit.pid, "untracked child died");
                        table.record_untracked(exit.pid);
                    }
                }
            }
            ReaperCommand::Snapshot { reply } => {
                let _ = reply.send(ReaperSnapshot {
                    tracked: table.pids(),
                    untracked: table.untracked(),
                    active: active.load(Ordering::Relaxed),
                });
            }
        }
    }

    tracing::debug!(remaining = table.len(), "reaper stopped");
}

fn log_exit(exit: &ChildExit) {
    match (exit.status.code(), exit.status.signal()) {
        (Some(0), _) => tracing::info!(pid = exit.pid, "child exited with status 0"),
        (Some(code), _) => tracing::warn!(pid = exit.pid, code, "child exited with non-zero status"),
        (None, Some(signal)) => tracing::warn!(pid = exit.pid, signal, "child terminated by signal"),
        (None, None) => tracing::warn!(pid = exit.pid, "child exited with unknown status"),
    }
}

impl ReaperHandle {
    pub async fn register(&self, pid: u32, callback: ExitCallback) -> Result<(), ReaperError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReaperCommand::Register { pid, callback, reply })
            .map_err(|_| ReaperError::Stopped)?;
        rx.await.map_err(|_| ReaperError::Stopped)?
    }

    /// Like [`register`](Self::register), for callers outside the runtime.
    pub fn register_blocking(&self, pid: u32, callback: ExitCallback) -> Result<(), ReaperError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReaperCommand::Register { pid, callback, reply })
            .map_err(|_| ReaperError::Stopped)?;
        rx.blocking_recv().map_err(|_| ReaperError::Stopped)?
    }

    pub fn unregister(&self, pid: u32) {
        let _ = self.tx.send(ReaperCommand::Unregister { pid });
    }

    /// Report a child's death to the actor.
    pub fn report_exit(&self, exit: ChildExit) {
        if self.tx.send(ReaperCommand::Exited(exit)).is_err() {
            tracing::warn!(pid = exit.pid, "reaper gone, child exit dropped");
        }
    }

    pub async fn snapshot(&self) -> Result<ReaperSnapshot, ReaperError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReaperCommand::Snapshot { reply })
            .map_err(|_| ReaperError::Stopped)?;
        rx.await.map_err(|_| ReaperError::Stopped)
    }

    /// Children spawned and not yet reaped. Approximate under concurrency.
    pub fn active_children(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Spawn `cmd`, link it to `observer` and watch it until it exits.
    ///
    /// Must not be called from inside an async context: registration waits
    /// for the actor's answer.
    pub fn spawn_child(&self, cmd: &mut Command, observer: Arc<dyn ChildObserver>) -> io::Result<u32> {
        let mut child = {
            let _guard = self.runtime.enter();
            cmd.spawn()?
        };
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child has no pid after spawn"))?;
        self.active.fetch_add(1, Ordering::Relaxed);
        observer.attached(pid);
        tracing::debug!(pid, "child spawned");

        let on_exit = observer.clone();
        let registered = self.register_blocking(pid, Box::new(move |exit| on_exit.exited(exit)));

        if let Err(ref e) = registered {
            tracing::error!(pid, error = %e, "killing unwatched child");
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid, error = %e, "kill failed");
            }
        }

        let reaper = self.clone();
        self.runtime.spawn(async move {
            match child.wait().await {
                Ok(status) => reaper.report_exit(ChildExit::new(pid, status)),
                Err(e) => tracing::warn!(pid, error = %e, "waiting for child failed"),
            }
        });

        registered.map(|()| pid).map_err(io::Error::other)
    }
}
