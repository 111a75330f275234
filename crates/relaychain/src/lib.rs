//! relaychain: relay bytes between two chained addresses.

pub mod address;
pub mod commpair;
pub mod config;
pub mod direction;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
mod lockfile;
pub mod logging;
pub mod opener;
pub mod reaper;
pub mod relay;
pub mod shutdown;

pub use address::{AddressSpec, Hop, parse_chain, parse_single};
pub use config::{CommKind, DirectionMode, RelayConfig, TraceMode};
pub use direction::Direction;
pub use endpoint::Endpoint;
pub use engine::{Outcome, SessionSummary, TransferSession};
pub use error::{ChainError, OpenError, OpenStatus, ParseError, RelayError};
pub use lockfile::LockFile;
pub use opener::ChainOpener;
pub use reaper::ReaperHandle;
pub use relay::Relay;
