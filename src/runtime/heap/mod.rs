pub mod block;
pub mod block_manager;
pub mod manager;

use std::fmt;
use std::str::FromStr;

pub use block::{BlockState, HeapMemory, MemoryBlock};
pub use manager::{AcquireParams, HeapManager};

/// What [`HeapManager::acquire_space`] does when no heap has room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Poll the tracker until space frees up, bounded by a timeout.
    Wait,
    /// Allocate an additional heap; old heaps drain naturally.
    Extend,
    /// Allocate a new heap and retire the oldest one.
    DestructiveExtend,
    /// `Wait`, then `Extend` on timeout.
    #[default]
    WaitAndExtend,
    /// Fail; the client frees its own blocks with `clear_space`.
    ClientControlled,
}

impl Behavior {
    #[must_use]
    pub const fn extends(self) -> bool {
        matches!(
            self,
            Self::Extend | Self::DestructiveExtend | Self::WaitAndExtend
        )
    }

    #[must_use]
    pub const fn waits(self) -> bool {
        matches!(self, Self::Wait | Self::WaitAndExtend)
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::Extend => "extend",
            Self::DestructiveExtend => "destructiveExtend",
            Self::WaitAndExtend => "waitAndExtend",
            Self::ClientControlled => "clientControlled",
        };
        f.write_str(s)
    }
}

impl FromStr for Behavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "wait" => Ok(Self::Wait),
            "extend" => Ok(Self::Extend),
            "destructiveextend" => Ok(Self::DestructiveExtend),
            "waitandextend" => Ok(Self::WaitAndExtend),
            "clientcontrolled" => Ok(Self::ClientControlled),
            other => Err(format!("unknown heap behavior '{other}'")),
        }
    }
}
