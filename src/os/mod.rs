//! Services the heaps consume from the OS/graphics layer.

pub mod aperture;
pub mod device;

use crate::error::HeapResult;
use crate::runtime::tracker::TrackerCounter;

/// A raw GPU buffer as handed out by an [`OsInterface`].
#[derive(Debug)]
pub struct GpuResource {
    pub handle: u64,     // OS allocation handle
    pub size: usize,     // Size in bytes
    pub gpu_va: u64,     // GPU Virtual Address
    pub flags: AllocFlags,
    pub name: String,
}

/// Flags controlling buffer allocation
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub host_access: bool,
    pub hw_write_only: bool,
    pub executable: bool,
    pub uncached: bool,
    pub zeroed: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    /// GPU writes only; CPU mappings are write-combined.
    #[must_use]
    pub const fn hw_write_only(mut self) -> Self {
        self.hw_write_only = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.executable = true;
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    #[must_use]
    pub const fn zeroed(mut self) -> Self {
        self.zeroed = true;
        self
    }
}

/// A command buffer ready for execution.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Handle of the buffer holding the commands.
    pub buffer: u64,
    /// Bytes of the buffer that hold commands, from offset 0.
    pub used: usize,
    /// Resources that must be resident while the batch runs.
    pub resources: Vec<u64>,
    /// `(counter, value)` writes the batch performs when it completes.
    pub tracker_stores: Vec<(TrackerCounter, u32)>,
}

/// Allocation, mapping, residency and submission services.
pub trait OsInterface: Send + Sync + std::fmt::Debug {
    /// Allocates `size` bytes of GPU-visible memory.
    fn allocate(&self, size: usize, flags: AllocFlags, name: &str) -> HeapResult<GpuResource>;

    fn free(&self, resource: &GpuResource);

    /// Maps the resource for CPU access. Every `lock` must be paired with an
    /// `unlock`.
    fn lock(&self, resource: &GpuResource) -> HeapResult<*mut u8>;

    fn unlock(&self, resource: &GpuResource);

    /// Adds a buffer to the residency list of the next submission.
    fn register_resource(&self, handle: u64, write: bool) -> HeapResult<()>;

    fn submit(&self, submission: Submission) -> HeapResult<()>;
}
