//! Address drivers and the keyword registry.
//!
//! Each keyword maps to one or more [`AddressDesc`] variants. Variants of a
//! keyword differ in the directions they support; the opener picks the one
//! that fits the hop's context.

mod exec;
mod fd;
mod file;
mod frame;
mod inter;
mod pipe;
mod socket;
mod stdio;

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::sync::OnceLock;

use crate::address::AddressOptions;
use crate::config::RelayConfig;
use crate::direction::{DirMask, Direction};
use crate::endpoint::{ShutdownAction, ShutdownPolicy, Stream, StreamFds};
use crate::error::OpenError;
use crate::reaper::ReaperHandle;

pub use frame::FrameLayer;

/// Opens one sub-address and returns its stream.
pub type OpenFn = fn(OpenRequest<'_>) -> Result<Stream, OpenError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    /// Terminates a chain.
    Endpoint,
    /// Sits between two hops and works on a carrier stream.
    Inter,
}

/// Static description of one driver variant.
#[derive(Debug)]
pub struct AddressDesc {
    pub keyword: &'static str,
    pub kind: DescKind,
    pub min_params: usize,
    pub max_params: usize,
    /// Directions toward the consumer of the hop.
    pub local_dirs: DirMask,
    /// Directions toward the next hop. Empty for endpoints.
    pub net_dirs: DirMask,
    pub open: OpenFn,
    /// Driver-specific constants.
    pub args: [i32; 3],
}

impl AddressDesc {
    pub fn accepts_params(&self, given: usize) -> bool {
        (self.min_params..=self.max_params).contains(&given)
    }

    /// Whether this variant fits a hop that needs `local` toward its
    /// consumer and, unless final, `net` toward the next hop.
    pub fn fits(&self, local: Direction, net: Option<Direction>) -> bool {
        if !self.local_dirs.admits(local) {
            return false;
        }
        match net {
            None => true,
            Some(net) => self.kind == DescKind::Inter && self.net_dirs.admits(net),
        }
    }
}

bitflags::bitflags! {
    /// What an open call is allowed to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        const MAY_CHILD = 0b01;
        const MAY_EXEC = 0b10;
    }
}

/// Process-wide collaborators a driver may need.
#[derive(Debug, Clone, Default)]
pub struct DriverEnv {
    pub reaper: Option<ReaperHandle>,
    pub config: RelayConfig,
}

/// Everything handed to a driver's open function.
pub struct OpenRequest<'a> {
    pub keyword: &'a str,
    pub params: &'a [String],
    pub options: &'a AddressOptions,
    pub direction: Direction,
    pub caps: Caps,
    pub args: [i32; 3],
    /// For intermediate drivers: the stream facing the neighbouring hop.
    pub carrier: Option<Stream>,
    pub env: &'a DriverEnv,
}

impl OpenRequest<'_> {
    pub fn param(&self, i: usize) -> Result<&str, OpenError> {
        self.params
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| OpenError::no_retry(format!("{}: missing parameter {}", self.keyword, i + 1)))
    }

    pub fn take_carrier(&mut self) -> Result<Stream, OpenError> {
        self.carrier
            .take()
            .ok_or_else(|| OpenError::no_retry(format!("{}: must be used within a chain", self.keyword)))
    }
}

/// Shutdown policy for plain descriptors, chosen by what they are.
///
/// Sockets are half-closed, separate descriptors are closed, and a single
/// non-socket descriptor is left alone so its read side survives.
pub(crate) fn plain_shutdown(fds: &StreamFds) -> ShutdownPolicy {
    let Some(file) = fds.read_file().or(fds.write_file()) else {
        return ShutdownPolicy::both(ShutdownAction::None);
    };
    let is_socket = file.metadata().is_ok_and(|m| m.file_type().is_socket());
    match fds {
        _ if is_socket => ShutdownPolicy::socket(),
        StreamFds::Split { .. } => ShutdownPolicy::both(ShutdownAction::Close),
        _ => ShutdownPolicy::both(ShutdownAction::None),
    }
}

/// Keyword lookup over every known driver variant.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    by_keyword: HashMap<String, Vec<&'static AddressDesc>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        for table in [
            stdio::DESCS,
            fd::DESCS,
            file::DESCS,
            pipe::DESCS,
            exec::DESCS,
            socket::DESCS,
            inter::DESCS,
            frame::DESCS,
        ] {
            for desc in table {
                registry.register(desc);
            }
        }
        registry.alias("-", "STDIO");
        registry
    }

    pub fn register(&mut self, desc: &'static AddressDesc) {
        self.by_keyword
            .entry(desc.keyword.to_ascii_uppercase())
            .or_default()
            .push(desc);
    }

    fn alias(&mut self, alias: &str, keyword: &str) {
        if let Some(descs) = self.by_keyword.get(keyword).cloned() {
            self.by_keyword.insert(alias.to_ascii_uppercase(), descs);
        }
    }

    /// All variants of a keyword, matched case-insensitively.
    pub fn lookup(&self, keyword: &str) -> Option<&[&'static AddressDesc]> {
        self.by_keyword
            .get(&keyword.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

}

/// The shared registry of built-in drivers.
pub fn builtin() -> &'static DriverRegistry {
    static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
    REGISTRY.get_or_init(DriverRegistry::with_builtin_drivers)
}
