use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No tracker registered with the heap manager")]
    TrackerNotRegistered,

    #[error("Insufficient heap space: {needed} bytes needed")]
    NoSpace { needed: usize },

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("GPU allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Binding table entries exhausted")]
    TooManyBindingTableEntries,

    #[error("Surface state slots exhausted")]
    TooManySurfaceStates,

    #[error("Command buffer full: {needed} bytes needed, {remaining} remaining")]
    CommandBufferFull { needed: usize, remaining: usize },

    #[error("Kernel still referenced by pending work: {0}")]
    KernelBusy(String),

    #[error("Unknown heap id: {0}")]
    UnknownHeap(u32),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl HeapError {
    /// Capacity errors are retried by callers; everything else aborts.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::NoSpace { .. }
                | Self::TooManyBindingTableEntries
                | Self::TooManySurfaceStates
                | Self::CommandBufferFull { .. }
        )
    }
}

// A convenient alias
pub type HeapResult<T> = Result<T, HeapError>;
