//! Data directions and the capability masks drivers advertise.

use std::fmt;

/// Direction of an endpoint as seen by whoever consumes it.
///
/// `Read` means the consumer only reads from the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn can_read(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }

    /// The same data flow seen from the other end of a channel.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
            Direction::ReadWrite => Direction::ReadWrite,
        }
    }

    pub fn from_parts(read: bool, write: bool) -> Option<Direction> {
        match (read, write) {
            (true, true) => Some(Direction::ReadWrite),
            (true, false) => Some(Direction::Read),
            (false, true) => Some(Direction::Write),
            (false, false) => None,
        }
    }

    pub fn mask(self) -> DirMask {
        match self {
            Direction::Read => DirMask::READ,
            Direction::Write => DirMask::WRITE,
            Direction::ReadWrite => DirMask::READ_WRITE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Read => "read-only",
            Direction::Write => "write-only",
            Direction::ReadWrite => "read-write",
        })
    }
}

bitflags::bitflags! {
    /// Set of directions a driver side supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirMask: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const READ_WRITE = 0b100;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::READ_WRITE.bits();
    }
}

impl DirMask {
    pub fn admits(self, direction: Direction) -> bool {
        self.intersects(direction.mask())
    }
}
